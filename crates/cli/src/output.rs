//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use creevey_runner::runner::{FailedTest, RunSummary};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

impl TableDisplay for FailedTest {
    fn headers() -> Vec<&'static str> {
        vec!["Test", "Retries", "Error"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.title.clone(),
            self.retries.to_string(),
            self.error.clone().unwrap_or_default(),
        ]
    }
}

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Counts table for a run
pub fn summary_table(summary: &RunSummary) -> Table {
    let mut table = table();
    table.set_header(vec!["Passed", "Failed", "Pending", "Skipped", "Total", "Duration"]);
    let failed = Cell::new(summary.failed).fg(if summary.failed > 0 {
        Color::Red
    } else {
        Color::Reset
    });
    table.add_row(vec![
        Cell::new(summary.passed).fg(Color::Green),
        failed,
        Cell::new(summary.pending),
        Cell::new(summary.skipped),
        Cell::new(summary.total),
        Cell::new(format!("{:.1}s", summary.duration_ms as f64 / 1000.0)),
    ]);
    table
}

/// Print a list of items
pub fn print_list<T: TableDisplay>(items: &[T]) {
    let mut table = table();
    table.set_header(T::headers());
    for item in items {
        table.add_row(item.row());
    }
    println!("{table}");
}

pub fn print_summary(summary: &RunSummary, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(summary).unwrap_or_default());
        }
        OutputFormat::Table => {
            if !summary.failures.is_empty() {
                print_list(&summary.failures);
            }
            println!("{}", summary_table(summary));
            if summary.is_success() {
                print_success("All tests passed");
            } else {
                print_error(&format!("{} tests failed", summary.failed));
            }
        }
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("{} {}", "✔".green(), message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✖".red(), message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    eprintln!("{} {}", "!".yellow(), message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue(), message);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(failed: usize) -> RunSummary {
        RunSummary {
            total: 4,
            passed: 3 - failed,
            failed,
            skipped: 1,
            pending: 0,
            duration_ms: 1500,
            failures: (0..failed)
                .map(|i| FailedTest {
                    id: format!("id{}", i),
                    title: format!("Button / Primary {} / chrome", i),
                    retries: 1,
                    error: Some("expected image 'chrome' does not exist".into()),
                })
                .collect(),
        }
    }

    #[test]
    fn test_summary_table_contents() {
        let rendered = summary_table(&summary(1)).to_string();
        assert!(rendered.contains("Passed"));
        assert!(rendered.contains("1.5s"));
    }

    #[test]
    fn test_failed_row() {
        let summary = summary(2);
        let row = summary.failures[1].row();
        assert_eq!(row.len(), FailedTest::headers().len());
        assert_eq!(row[0], "Button / Primary 1 / chrome");
        assert_eq!(row[1], "1");
    }
}
