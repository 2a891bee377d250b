use std::{fs, io};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use crate::{
    config::{PipelineConfig, Verbosity},
    error::HostsError,
    hosts::HostsFile,
    identity::IdentityContext,
    invoker::ToolInvoker,
    pipeline::{Orchestrator, Target},
};

mod address;
mod args;
mod config;
mod error;
mod hosts;
mod identity;
mod invoker;
mod logging;
mod pipeline;
mod report;
mod template;

fn main() -> Result<()> {
    let args = args::Args::parse();
    let verbosity = if args.debug {
        Verbosity::Debug
    } else {
        Verbosity::Normal
    };
    logging::init(verbosity);

    let hosts = HostsFile::system();
    if args.remove_host {
        hosts.remove(&args.hostname).with_context(|| {
            format!(
                "could not remove {} from {}",
                args.hostname,
                hosts.path().display()
            )
        })?;
        return Ok(());
    }

    let (Some(ip), Some(output_dir)) = (args.ip, args.output_dir) else {
        bail!("--ip and --output-dir are required");
    };

    if !address::is_valid_ipv4(&ip) {
        warn!("{ip} does not look like an IPv4 address");
    }

    let mut config = PipelineConfig::load(&args.config)?;
    if let Some(secs) = args.timeout {
        config.timeout_secs = Some(secs);
        config.validate()?;
    }

    fs::create_dir_all(&output_dir)
        .with_context(|| format!("could not create output directory {}", output_dir.display()))?;

    let target = Target {
        ip,
        hostname: args.hostname,
        output_dir: output_dir.display().to_string(),
    };
    let invoker = ToolInvoker::new(IdentityContext::from_env(), verbosity)
        .context("could not start process runtime")?;

    let report = Orchestrator::new(&config, &invoker).run(
        &target,
        (!args.skip_hosts).then_some(&hosts),
        confirm_continue,
    )?;

    report::print_summary(&report, &target.output_dir, verbosity);
    if !report.all_passed() {
        info!("{} tool(s) reported failures", report.failures().count());
    }

    Ok(())
}

fn confirm_continue(err: &HostsError) -> bool {
    error!("Failed to update hosts file ({err}). Continue anyway? (y/n)");
    let mut answer = String::new();
    match io::stdin().read_line(&mut answer) {
        Ok(_) => answer.trim().eq_ignore_ascii_case("y"),
        Err(_) => false,
    }
}
