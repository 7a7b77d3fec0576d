//! Headless run for CI

use clap::Args;
use creevey_common::Request;
use std::path::Path;
use std::time::Instant;

use super::{build_runner, load_config, ConfigOverrides};
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub overrides: ConfigOverrides,

    /// Run workers as tasks of this process instead of child processes
    #[arg(long)]
    pub in_process: bool,

    /// Summary format
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

/// Run every test; returns whether all of them passed
pub async fn execute(args: RunArgs, config_path: &Path) -> anyhow::Result<bool> {
    let config = load_config(config_path, &args.overrides)?;
    let runner = build_runner(config, args.in_process)?;
    for e in runner.compile_errors() {
        output::print_warning(e);
    }

    let start = Instant::now();
    runner.handle(Request::Start(Vec::new()))?;
    tokio::select! {
        _ = runner.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            output::print_warning("Interrupted; waiting for tests in flight");
            runner.stop();
            runner.wait().await;
        }
    }

    let summary = runner.summary(start.elapsed());
    runner.write_results(&summary)?;
    output::print_summary(&summary, args.format);

    Ok(summary.is_success())
}
