use std::{
    io,
    process::Stdio,
    time::{Duration, Instant},
};

use tokio::{process::Command, runtime::Runtime};
use tracing::{debug, error, info};

use crate::{
    config::{ToolSpec, Verbosity},
    error::TemplateError,
    identity::IdentityContext,
    report::excerpt,
    template::Variables,
};

const DEBUG_EXCERPT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    NonZeroExit(i32),
    Timeout,
    LaunchError(String),
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub name: String,
    pub outcome: Outcome,
    pub stdout: String,
    pub stderr: String,
    pub output_file: Option<String>,
    pub elapsed: Duration,
}

impl ToolResult {
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Exit code in the `-1 means it never exited normally` convention.
    pub fn return_code(&self) -> i32 {
        match self.outcome {
            Outcome::Success => 0,
            Outcome::NonZeroExit(code) => code,
            Outcome::Timeout | Outcome::LaunchError(_) => -1,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Timeout => Some("timeout"),
            Outcome::LaunchError(message) => Some(message),
            _ => None,
        }
    }
}

/// A tool's fully substituted command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub output_file: Option<String>,
}

impl Invocation {
    pub fn prepare(
        tool: &ToolSpec,
        vars: &Variables,
        identity: &IdentityContext,
    ) -> Result<Self, TemplateError> {
        let mut vars = vars.clone();
        if let Some(wordlist) = &tool.wordlist {
            let wordlist = identity.expand(&vars.substitute(wordlist)?);
            vars.set("wordlist", wordlist);
        }

        let mut args = tool
            .arguments
            .iter()
            .map(|arg| vars.substitute(arg))
            .collect::<Result<Vec<String>, TemplateError>>()?;

        let output_file = match &tool.output_file {
            Some(template) => Some(identity.expand(&vars.substitute(template)?)),
            None => None,
        };
        if let (Some(path), Some(flags)) = (&output_file, &tool.output_args) {
            args.extend(flags.iter().cloned());
            args.push(path.clone());
        }

        Ok(Self {
            program: tool.executable.clone(),
            args,
            output_file,
        })
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<&str>>()
            .join(" ")
    }
}

/// Runs one external tool at a time on behalf of the caller's thread. Safe to
/// share between threads; each `invoke` blocks only its caller.
pub struct ToolInvoker {
    runtime: Runtime,
    identity: IdentityContext,
    verbosity: Verbosity,
}

impl ToolInvoker {
    pub fn new(identity: IdentityContext, verbosity: Verbosity) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("pathfinder-io")
            .enable_all()
            .build()?;

        if let Some(original) = &identity.original {
            debug!("resolving ~ against {}'s home", original.name);
        }

        Ok(Self {
            runtime,
            identity,
            verbosity,
        })
    }

    /// Never fails: every fault ends up in the returned result.
    pub fn invoke(&self, tool: &ToolSpec, vars: &Variables, timeout: Duration) -> ToolResult {
        let start = Instant::now();

        let invocation = match Invocation::prepare(tool, vars, &self.identity) {
            Ok(invocation) => invocation,
            Err(err) => {
                error!("{} failed: {err}", tool.name);
                return ToolResult {
                    name: tool.name.clone(),
                    outcome: Outcome::LaunchError(err.to_string()),
                    stdout: String::new(),
                    stderr: String::new(),
                    output_file: None,
                    elapsed: start.elapsed(),
                };
            }
        };

        info!("Running {}...", tool.name);
        info!("    Command: {}", invocation.command_line());

        let (outcome, stdout, stderr) = self.runtime.block_on(execute(&invocation, timeout));

        let result = ToolResult {
            name: tool.name.clone(),
            outcome,
            stdout,
            stderr,
            output_file: invocation.output_file,
            elapsed: start.elapsed(),
        };
        self.log_result(&result, timeout);
        result
    }

    fn log_result(&self, result: &ToolResult, timeout: Duration) {
        let name = &result.name;
        match &result.outcome {
            Outcome::Success => info!("{name} completed"),
            Outcome::NonZeroExit(code) => {
                error!("{name} completed with errors (return code: {code})")
            }
            Outcome::Timeout => error!("{name} timed out after {timeout:?}"),
            Outcome::LaunchError(message) => error!("{name} failed: {message}"),
        }

        if matches!(result.outcome, Outcome::Success | Outcome::NonZeroExit(_)) {
            if let Some(path) = &result.output_file {
                info!("    Output saved to: {path}");
            }
        }

        if self.verbosity.is_debug() {
            debug!("    Return code: {}", result.return_code());
            debug!("    Elapsed: {:.1?}", result.elapsed);
            if !result.stdout.is_empty() {
                debug!("    STDOUT: {}", excerpt(&result.stdout, DEBUG_EXCERPT));
            }
            if !result.stderr.is_empty() {
                debug!("    STDERR: {}", excerpt(&result.stderr, DEBUG_EXCERPT));
            }
        }
    }
}

async fn execute(invocation: &Invocation, timeout: Duration) -> (Outcome, String, String) {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    // Dropping the `output` future on timeout kills the child.
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let outcome = match output.status.code() {
                Some(0) => Outcome::Success,
                Some(code) => Outcome::NonZeroExit(code),
                None => Outcome::NonZeroExit(-1),
            };
            (outcome, stdout, stderr)
        }
        Ok(Err(err)) => (
            Outcome::LaunchError(format!("failed to launch {}: {err}", invocation.program)),
            String::new(),
            String::new(),
        ),
        Err(_) => (Outcome::Timeout, String::new(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use std::path::PathBuf;

    const SHORT: Duration = Duration::from_secs(10);

    fn invoker() -> ToolInvoker {
        ToolInvoker::new(IdentityContext::default(), Verbosity::Debug).unwrap()
    }

    fn vars() -> Variables {
        Variables::new("10.0.0.5", "lab", "/tmp/out")
    }

    fn tool(name: &str, executable: &str, args: &[&str]) -> ToolSpec {
        let mut tool = ToolSpec::new(name, executable);
        tool.arguments = args.iter().map(|a| a.to_string()).collect();
        tool
    }

    #[test]
    fn prepare_substitutes_and_appends_output_flags() {
        let mut spec = tool("nmap", "nmap", &["-sV", "{ip}"]);
        spec.output_file = Some("{output_dir}/nmap_{hostname}.txt".to_string());
        spec.output_args = Some(vec!["-oN".to_string()]);

        let invocation = Invocation::prepare(&spec, &vars(), &IdentityContext::default()).unwrap();

        assert_eq!(invocation.program, "nmap");
        assert_eq!(
            invocation.args,
            vec!["-sV", "10.0.0.5", "-oN", "/tmp/out/nmap_lab.txt"]
        );
        assert_eq!(invocation.output_file.as_deref(), Some("/tmp/out/nmap_lab.txt"));
        assert_eq!(invocation.command_line(), "nmap -sV 10.0.0.5 -oN /tmp/out/nmap_lab.txt");
    }

    #[test]
    fn output_file_without_flags_is_not_appended() {
        let mut spec = tool("x", "x", &["{ip}"]);
        spec.output_file = Some("{output_dir}/x.txt".to_string());

        let invocation = Invocation::prepare(&spec, &vars(), &IdentityContext::default()).unwrap();

        assert_eq!(invocation.args, vec!["10.0.0.5"]);
        assert_eq!(invocation.output_file.as_deref(), Some("/tmp/out/x.txt"));
    }

    #[test]
    fn wordlist_resolves_against_invoking_user_home() {
        let identity = IdentityContext {
            current_home: Some(PathBuf::from("/root")),
            original: Some(Identity {
                name: "alice".to_string(),
                home: PathBuf::from("/home/alice"),
            }),
        };
        let mut spec = tool("gobuster", "gobuster", &["--wordlist={wordlist}"]);
        spec.wordlist = Some("~/lists/common.txt".to_string());
        spec.output_file = Some("~/scans/{hostname}.txt".to_string());

        let invocation = Invocation::prepare(&spec, &vars(), &identity).unwrap();

        assert_eq!(invocation.args, vec!["--wordlist=/home/alice/lists/common.txt"]);
        assert_eq!(invocation.output_file.as_deref(), Some("/home/alice/scans/lab.txt"));
    }

    #[test]
    fn missing_variable_becomes_launch_error() {
        let spec = tool("gobuster", "definitely-not-run", &["-w", "{wordlist}"]);

        let result = invoker().invoke(&spec, &vars(), SHORT);

        assert!(!result.passed());
        match &result.outcome {
            Outcome::LaunchError(message) => assert!(message.contains("wordlist")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(result.return_code(), -1);
    }

    #[test]
    fn missing_executable_becomes_launch_error() {
        let spec = tool("ghost", "/nonexistent/bin/ghost-scanner", &[]);

        let result = invoker().invoke(&spec, &vars(), SHORT);

        assert!(matches!(result.outcome, Outcome::LaunchError(_)));
    }

    #[cfg(unix)]
    #[test]
    fn captures_output_of_successful_tool() {
        let spec = tool("echo", "sh", &["-c", "echo {hostname}; echo warn >&2"]);

        let result = invoker().invoke(&spec, &vars(), SHORT);

        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.stdout, "lab\n");
        assert_eq!(result.stderr, "warn\n");
        assert!(result.error().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_reported_with_code() {
        let spec = tool("failing", "sh", &["-c", "echo oops >&2; exit 3"]);

        let result = invoker().invoke(&spec, &vars(), SHORT);

        assert_eq!(result.outcome, Outcome::NonZeroExit(3));
        assert_eq!(result.return_code(), 3);
        assert_eq!(result.stderr, "oops\n");
    }

    #[cfg(unix)]
    #[test]
    fn hung_tool_is_killed_at_timeout() {
        let spec = tool("hang", "sleep", &["30"]);

        let started = Instant::now();
        let result = invoker().invoke(&spec, &vars(), Duration::from_millis(300));

        assert_eq!(result.outcome, Outcome::Timeout);
        assert_eq!(result.error(), Some("timeout"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
