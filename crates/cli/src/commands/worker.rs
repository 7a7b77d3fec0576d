//! Worker process entry point

use clap::Args;
use creevey_common::Config;
use creevey_runner::{
    compile, report_stdio_error, serve_stdio, PixelComparator, TestRunner, WebDriverConnector,
    Worker, WorkerContext,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Args)]
pub struct WorkerArgs {
    /// Browser this worker drives
    #[arg(long)]
    pub browser: String,
}

pub async fn execute(args: WorkerArgs, config_path: &Path) -> anyhow::Result<()> {
    let worker = match setup(&args.browser, config_path) {
        Ok(worker) => worker,
        Err(e) => {
            error!("{} worker failed to start: {:#}", args.browser, e);
            // the orchestrator reads the reason from stdout, not stderr
            if let Err(report) = report_stdio_error(&format!("{:#}", e)).await {
                error!("Failed to report worker error: {}", report);
            }
            return Err(e);
        }
    };
    serve_stdio(worker).await?;
    Ok(())
}

/// Load the configuration and stories and compile this browser's tests
fn setup(browser: &str, config_path: &Path) -> anyhow::Result<Worker> {
    let config = Config::load(config_path)?;
    let settings = config
        .browser(browser)
        .ok_or_else(|| anyhow::anyhow!("Browser '{}' is not enabled", browser))?;

    let stories = TestRunner::load_stories(&config)?;
    let catalog = compile(&settings.name, &stories);
    info!(
        "{} worker (pid {}) serving {} tests",
        settings.name,
        std::process::id(),
        catalog.tests.len()
    );

    let comparator = PixelComparator::new(config.threshold);
    let ctx = WorkerContext::new(
        Arc::new(config),
        Arc::new(WebDriverConnector::new()?),
        Arc::new(comparator),
    );
    Ok(Worker::new(settings, catalog, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_rejects_disabled_browser() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creevey.toml");
        std::fs::write(&path, "[browsers]\nchrome = true\nff = false\n").unwrap();

        let err = setup("ff", &path).err().unwrap();
        assert_eq!(err.to_string(), "Browser 'ff' is not enabled");
    }

    #[test]
    fn test_setup_reports_missing_stories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creevey.toml");
        let stories = dir.path().join("missing.json");
        std::fs::write(
            &path,
            format!("stories_path = {:?}\n\n[browsers]\nchrome = true\n", stories),
        )
        .unwrap();

        assert!(setup("chrome", &path).is_err());
    }
}
