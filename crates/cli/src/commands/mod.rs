//! CLI Commands

pub mod approve;
pub mod run;
pub mod serve;
pub mod worker;

use clap::Args;
use creevey_common::Config;
use creevey_runner::{PixelComparator, ProcessSpawner, TestRunner, WebDriverConnector};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Settings that override the configuration file
#[derive(Args, Debug, Default)]
pub struct ConfigOverrides {
    /// WebDriver grid endpoint
    #[arg(long, env = "CREEVEY_GRID_URL")]
    pub grid_url: Option<String>,

    /// Storybook address as seen from the grid
    #[arg(long, env = "CREEVEY_STORYBOOK_URL")]
    pub storybook_url: Option<String>,

    /// Only run these browsers (repeatable)
    #[arg(short, long = "browser")]
    pub browsers: Vec<String>,
}

/// Load the configuration file and apply command-line overrides
pub fn load_config(path: &Path, overrides: &ConfigOverrides) -> anyhow::Result<Config> {
    let mut config = Config::load(path)?;
    if let Some(grid_url) = &overrides.grid_url {
        config.grid_url = grid_url.clone();
    }
    if let Some(storybook_url) = &overrides.storybook_url {
        config.storybook_url = storybook_url.clone();
    }
    config.retain_browsers(&overrides.browsers)?;
    config.validate()?;
    debug!("Configuration: {:?}", config);
    Ok(config)
}

/// Build a runner whose workers are child processes, or tasks with `in_process`
pub fn build_runner(config: Config, in_process: bool) -> anyhow::Result<TestRunner> {
    let stories = TestRunner::load_stories(&config)?;

    let runner = if in_process {
        info!("Running workers in-process");
        let comparator = PixelComparator::new(config.threshold);
        TestRunner::in_process(
            config,
            stories,
            Arc::new(WebDriverConnector::new()?),
            Arc::new(comparator),
        )?
    } else {
        // workers read the effective configuration, overrides included
        let resolved = config.report_dir.join("creevey.resolved.toml");
        config.save(&resolved)?;
        let spawner = ProcessSpawner::current_exe(resolved)?;
        TestRunner::new(config, &stories, Arc::new(spawner))?
    };

    Ok(runner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply() {
        let overrides = ConfigOverrides {
            grid_url: Some("http://grid:4444".into()),
            storybook_url: None,
            browsers: vec!["chrome".into()],
        };
        let config = load_config(Path::new("does-not-exist.toml"), &overrides).unwrap();
        assert_eq!(config.grid_url, "http://grid:4444");
        assert_eq!(config.storybook_url, "http://localhost:6006");
        assert_eq!(config.browsers().len(), 1);
    }

    #[test]
    fn test_unknown_browser_is_rejected() {
        let overrides = ConfigOverrides {
            browsers: vec!["safari".into()],
            ..Default::default()
        };
        assert!(load_config(Path::new("does-not-exist.toml"), &overrides).is_err());
    }
}
