use std::{collections::BTreeMap, sync::mpsc};

use rayon::{prelude::*, ThreadPoolBuilder};
use tracing::{error, info, warn};

use crate::{
    config::{OrderKey, PipelineConfig, ToolSpec},
    error::{HostsError, PipelineError},
    hosts::{HostsChange, HostsFile},
    invoker::{ToolInvoker, ToolResult},
    template::Variables,
};

#[derive(Debug, Clone)]
pub struct Target {
    pub ip: String,
    pub hostname: String,
    pub output_dir: String,
}

/// Tools sharing one order key.
#[derive(Debug)]
pub struct ExecutionGroup<'a> {
    pub key: OrderKey,
    pub tools: Vec<&'a ToolSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostsStep {
    Skipped,
    Applied(HostsChange),
    Failed(String),
}

#[derive(Debug)]
pub struct RunReport {
    pub hosts: HostsStep,
    pub results: Vec<ToolResult>,
}

impl RunReport {
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(ToolResult::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ToolResult> {
        self.results.iter().filter(|result| !result.passed())
    }
}

/// Groups tools by order key, ascending, keeping config order inside a group.
pub fn group_by_order(tools: &[ToolSpec]) -> Vec<ExecutionGroup<'_>> {
    let mut groups: BTreeMap<OrderKey, Vec<&ToolSpec>> = BTreeMap::new();
    for tool in tools {
        groups.entry(tool.order_key()).or_default().push(tool);
    }

    groups
        .into_iter()
        .map(|(key, tools)| ExecutionGroup { key, tools })
        .collect()
}

pub struct Orchestrator<'a> {
    config: &'a PipelineConfig,
    invoker: &'a ToolInvoker,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a PipelineConfig, invoker: &'a ToolInvoker) -> Self {
        Self { config, invoker }
    }

    /// Registers the target in `hosts` (unless `None`) and runs every tool.
    /// A failed hosts update only stops the run when `proceed` says so.
    pub fn run<F>(
        &self,
        target: &Target,
        hosts: Option<&HostsFile>,
        proceed: F,
    ) -> Result<RunReport, PipelineError>
    where
        F: FnOnce(&HostsError) -> bool,
    {
        let hosts = match hosts {
            None => {
                info!("Skipping hosts file update");
                HostsStep::Skipped
            }
            Some(hosts) => match hosts.upsert(&target.ip, &target.hostname) {
                Ok(change) => HostsStep::Applied(change),
                Err(err) => {
                    error!("Failed to update {}: {err}", hosts.path().display());
                    if !proceed(&err) {
                        return Err(PipelineError::Aborted(err));
                    }
                    HostsStep::Failed(err.to_string())
                }
            },
        };

        let vars = Variables::new(&target.ip, &target.hostname, &target.output_dir);
        let results = self.run_tools(&vars);

        Ok(RunReport { hosts, results })
    }

    /// Runs the groups one after another. Every tool of a group has returned,
    /// timed out or failed to launch before the next group starts.
    pub fn run_tools(&self, vars: &Variables) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(self.config.tools.len());
        for group in group_by_order(&self.config.tools) {
            results.extend(self.run_group(&group, vars));
        }
        results
    }

    fn run_group(&self, group: &ExecutionGroup<'_>, vars: &Variables) -> Vec<ToolResult> {
        if let [tool] = group.tools.as_slice() {
            return vec![self.invoke(tool, vars)];
        }

        info!(
            "Running {} tools in parallel (order {})...",
            group.tools.len(),
            group.key
        );

        // One thread per tool so every member starts right away.
        let pool = match ThreadPoolBuilder::new()
            .num_threads(group.tools.len())
            .thread_name(|i| format!("pathfinder-tool-{i}"))
            .build()
        {
            Ok(pool) => pool,
            Err(err) => {
                warn!(
                    "Could not start worker pool ({err}), running order {} sequentially",
                    group.key
                );
                return group.tools.iter().map(|tool| self.invoke(tool, vars)).collect();
            }
        };

        let (tx, rx) = mpsc::channel();
        pool.install(|| {
            group.tools.par_iter().for_each_with(tx, |tx, tool| {
                // The receiver outlives the pool, so sending cannot fail.
                let _ = tx.send(self.invoke(tool, vars));
            })
        });

        // Arrival order.
        rx.into_iter().collect()
    }

    fn invoke(&self, tool: &ToolSpec, vars: &Variables) -> ToolResult {
        self.invoker.invoke(tool, vars, self.config.timeout_for(tool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Verbosity,
        hosts::Privilege,
        identity::IdentityContext,
        invoker::Outcome,
    };
    use std::{
        fs,
        time::{Duration, Instant},
    };
    use tempfile::TempDir;

    fn invoker() -> ToolInvoker {
        ToolInvoker::new(IdentityContext::default(), Verbosity::Normal).unwrap()
    }

    fn tool(name: &str, order: Option<i64>, executable: &str, args: &[&str]) -> ToolSpec {
        let mut tool = ToolSpec::new(name, executable);
        tool.order = order;
        tool.arguments = args.iter().map(|a| a.to_string()).collect();
        tool
    }

    /// A tool that records when it starts and ends in `{output_dir}/trace`.
    fn traced(name: &str, order: Option<i64>, secs: &str) -> ToolSpec {
        let script = format!(
            "echo start {name} >> {{output_dir}}/trace; sleep {secs}; echo end {name} >> {{output_dir}}/trace"
        );
        tool(name, order, "sh", &["-c", &script])
    }

    fn target(dir: &TempDir) -> Target {
        Target {
            ip: "10.0.0.5".to_string(),
            hostname: "lab".to_string(),
            output_dir: dir.path().display().to_string(),
        }
    }

    fn trace(dir: &TempDir) -> Vec<String> {
        fs::read_to_string(dir.path().join("trace"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn position(trace: &[String], line: &str) -> usize {
        trace
            .iter()
            .position(|l| l == line)
            .unwrap_or_else(|| panic!("{line:?} missing from {trace:?}"))
    }

    #[test]
    fn groups_ascend_and_unordered_runs_last() {
        let tools = vec![
            tool("A", Some(1), "a", &[]),
            tool("B", Some(2), "b", &[]),
            tool("Z", None, "z", &[]),
            tool("C", Some(2), "c", &[]),
            tool("D", Some(1), "d", &[]),
            tool("E", Some(-5), "e", &[]),
        ];

        let groups = group_by_order(&tools);
        let shape: Vec<(OrderKey, Vec<&str>)> = groups
            .iter()
            .map(|g| (g.key, g.tools.iter().map(|t| t.name.as_str()).collect()))
            .collect();

        assert_eq!(
            shape,
            vec![
                (OrderKey::Explicit(-5), vec!["E"]),
                (OrderKey::Explicit(1), vec!["A", "D"]),
                (OrderKey::Explicit(2), vec!["B", "C"]),
                (OrderKey::Unordered, vec!["Z"]),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn lower_order_completes_before_higher_order_starts() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig {
            timeout_secs: Some(30),
            tools: vec![
                traced("A", Some(1), "0.5"),
                traced("B", Some(2), "0.1"),
                traced("C", Some(2), "0.1"),
                traced("D", Some(1), "0.5"),
            ],
        };
        let invoker = invoker();

        let report = Orchestrator::new(&config, &invoker)
            .run(&target(&dir), None, |_| true)
            .unwrap();

        assert_eq!(report.hosts, HostsStep::Skipped);
        assert_eq!(report.results.len(), 4);
        assert!(report.all_passed());

        let mut first: Vec<&str> = report.results[..2].iter().map(|r| r.name.as_str()).collect();
        first.sort();
        assert_eq!(first, vec!["A", "D"]);

        let trace = trace(&dir);
        let last_end_of_first = position(&trace, "end A").max(position(&trace, "end D"));
        let first_start_of_second = position(&trace, "start B").min(position(&trace, "start C"));
        assert!(last_end_of_first < first_start_of_second, "{trace:?}");

        // A and D share a group, so both start before either finishes.
        let first_end = position(&trace, "end A").min(position(&trace, "end D"));
        assert!(position(&trace, "start A") < first_end, "{trace:?}");
        assert!(position(&trace, "start D") < first_end, "{trace:?}");
    }

    #[cfg(unix)]
    #[test]
    fn timed_out_tool_does_not_stop_the_pipeline() {
        let dir = TempDir::new().unwrap();
        let mut hang = tool("hang", Some(1), "sleep", &["30"]);
        hang.timeout_secs = Some(1);
        let config = PipelineConfig {
            timeout_secs: None,
            tools: vec![
                hang,
                tool("quick", Some(1), "true", &[]),
                tool("after", Some(2), "sh", &["-c", "echo {hostname}"]),
            ],
        };
        let invoker = invoker();

        let started = Instant::now();
        let report = Orchestrator::new(&config, &invoker)
            .run(&target(&dir), None, |_| true)
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(15));
        assert_eq!(report.results.len(), 3);

        let outcome = |name: &str| {
            report
                .results
                .iter()
                .find(|r| r.name == name)
                .map(|r| r.outcome.clone())
                .unwrap()
        };
        assert_eq!(outcome("hang"), Outcome::Timeout);
        assert_eq!(outcome("quick"), Outcome::Success);
        assert_eq!(outcome("after"), Outcome::Success);
        assert_eq!(report.results[2].name, "after");
        assert_eq!(report.results[2].stdout, "lab\n");
        assert_eq!(report.failures().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn failures_are_isolated_per_tool() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig {
            timeout_secs: Some(30),
            tools: vec![
                tool("missing-var", Some(1), "echo", &["{wordlist}"]),
                tool("missing-exe", Some(2), "/nonexistent/scanner", &[]),
                tool("fails", Some(3), "false", &[]),
                tool("ok", Some(4), "true", &[]),
            ],
        };
        let invoker = invoker();

        let report = Orchestrator::new(&config, &invoker)
            .run(&target(&dir), None, |_| true)
            .unwrap();

        let outcomes: Vec<&Outcome> = report.results.iter().map(|r| &r.outcome).collect();
        assert!(matches!(outcomes[0], Outcome::LaunchError(_)));
        assert!(matches!(outcomes[1], Outcome::LaunchError(_)));
        assert_eq!(outcomes[2], &Outcome::NonZeroExit(1));
        assert_eq!(outcomes[3], &Outcome::Success);
        assert!(!report.all_passed());
    }

    #[test]
    fn hosts_failure_aborts_when_operator_declines() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::default();
        let invoker = invoker();
        let hosts = HostsFile::new(dir.path().join("missing-hosts"), Privilege::Elevated);

        let result = Orchestrator::new(&config, &invoker).run(&target(&dir), Some(&hosts), |err| {
            assert!(matches!(err, HostsError::FileNotFound(_)));
            false
        });

        assert!(matches!(
            result,
            Err(PipelineError::Aborted(HostsError::FileNotFound(_)))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn hosts_failure_continues_when_operator_accepts() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig {
            timeout_secs: Some(30),
            tools: vec![tool("ok", None, "true", &[])],
        };
        let invoker = invoker();
        let hosts = HostsFile::new(dir.path().join("missing-hosts"), Privilege::Elevated);

        let report = Orchestrator::new(&config, &invoker)
            .run(&target(&dir), Some(&hosts), |_| true)
            .unwrap();

        assert!(matches!(report.hosts, HostsStep::Failed(ref msg) if msg.contains("not found")));
        assert_eq!(report.results.len(), 1);
        assert!(report.all_passed());
    }

    #[test]
    fn hosts_entry_is_registered_before_tools_run() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("hosts");
        fs::write(&table, "127.0.0.1 localhost\n").unwrap();
        let config = PipelineConfig::default();
        let invoker = invoker();
        let hosts = HostsFile::new(&table, Privilege::Elevated);

        let report = Orchestrator::new(&config, &invoker)
            .run(&target(&dir), Some(&hosts), |_| panic!("hosts update should succeed"))
            .unwrap();

        assert_eq!(report.hosts, HostsStep::Applied(HostsChange::Added));
        assert!(report.results.is_empty());
        assert_eq!(
            fs::read_to_string(&table).unwrap(),
            "127.0.0.1 localhost\n10.0.0.5 lab\n"
        );
    }
}
