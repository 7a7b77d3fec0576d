//! Baseline update from the last run's results

use clap::Args;
use creevey_common::{Config, ImageStore};
use creevey_runner::aggregator::{load_tests, Aggregator};
use std::path::Path;

use crate::output;

#[derive(Args)]
pub struct ApproveArgs {
    /// Approve every failed image of every test
    #[arg(long, conflicts_with = "ids")]
    pub all: bool,

    /// Approve the failed images of these tests only
    #[arg(required_unless_present = "all")]
    pub ids: Vec<String>,
}

pub fn execute(args: ApproveArgs, config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let tests = load_tests(&config.data_path())?;
    if tests.is_empty() {
        output::print_warning(&format!("No results found in {}", config.data_path().display()));
        return Ok(());
    }

    let images = ImageStore::new(&config.screen_dir, &config.report_dir);
    let aggregator = Aggregator::new(tests, images).with_data_path(config.data_path());

    let approved = if args.all {
        aggregator.approve_all()?
    } else {
        approve_tests(&aggregator, &args.ids)?
    };
    output::print_success(&format!("Approved {} images", approved));
    Ok(())
}

/// Approve every image of the latest attempt of each test, if it failed
fn approve_tests(aggregator: &Aggregator, ids: &[String]) -> anyhow::Result<usize> {
    let mut approved = 0;
    for id in ids {
        let test = aggregator
            .test(id)
            .ok_or_else(|| anyhow::anyhow!("Test not found: {}", id))?;
        let Some(retry) = test.results.len().checked_sub(1) else {
            output::print_warning(&format!("{} has no results", test.title()));
            continue;
        };
        let Some(result) = test.latest_result().filter(|r| !r.is_success()) else {
            output::print_info(&format!("{} passed; nothing to approve", test.title()));
            continue;
        };
        for image in result.images.iter().flat_map(|images| images.keys()) {
            aggregator.approve(id, retry as u32, image)?;
            approved += 1;
        }
    }
    Ok(approved)
}
