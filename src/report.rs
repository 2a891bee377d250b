use std::fmt;

use colored::*;

use crate::{
    config::Verbosity,
    hosts::HostsChange,
    invoker::ToolResult,
    pipeline::{HostsStep, RunReport},
};

const SUMMARY_EXCERPT: usize = 200;

/// The first `max_chars` characters of `text`.
pub fn excerpt(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// End-of-run banner: where results went, the hosts step and one line per tool.
pub struct Summary<'a> {
    pub report: &'a RunReport,
    pub output_dir: &'a str,
    pub verbosity: Verbosity,
}

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);

        writeln!(f, "\n{rule}")?;
        writeln!(f, "{}", "[+] All scans complete!".green())?;
        writeln!(f, "{}", format!("    Results saved to: {}/", self.output_dir).green())?;
        match &self.report.hosts {
            HostsStep::Skipped => {}
            HostsStep::Applied(change) => {
                let verb = match change {
                    HostsChange::Added => "entry added",
                    HostsChange::Updated => "entry updated",
                    HostsChange::Removed => "entry removed",
                    HostsChange::Unchanged => "unchanged",
                };
                writeln!(f, "{}", format!("    Hosts file: {verb}").green())?;
            }
            HostsStep::Failed(reason) => {
                writeln!(f, "{}", format!("    Hosts file: not updated ({reason})").red())?;
            }
        }

        writeln!(f, "\n[*] Summary:")?;
        for result in &self.report.results {
            self.fmt_result(f, result)?;
        }
        writeln!(f, "{rule}")
    }
}

impl Summary<'_> {
    fn fmt_result(&self, f: &mut fmt::Formatter<'_>, result: &ToolResult) -> fmt::Result {
        if result.passed() {
            return writeln!(f, "{}", format!("    ✓ {}", result.name).green());
        }

        writeln!(f, "{}", format!("    ✗ {}", result.name).red())?;
        if !self.verbosity.is_debug() {
            return Ok(());
        }

        writeln!(
            f,
            "{}",
            format!("      Return code: {}", result.return_code()).yellow()
        )?;
        if let Some(error) = result.error() {
            writeln!(f, "{}", format!("      Error: {error}").yellow())?;
        }
        if !result.stderr.is_empty() {
            let stderr = excerpt(&result.stderr, SUMMARY_EXCERPT);
            writeln!(f, "{}", format!("      STDERR: {stderr}").yellow())?;
        }
        Ok(())
    }
}

pub fn render_summary(report: &RunReport, output_dir: &str, verbosity: Verbosity) -> String {
    Summary {
        report,
        output_dir,
        verbosity,
    }
    .to_string()
}

pub fn print_summary(report: &RunReport, output_dir: &str, verbosity: Verbosity) {
    print!("{}", render_summary(report, output_dir, verbosity));
}
