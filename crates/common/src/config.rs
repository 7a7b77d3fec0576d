//! Runner configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Top-level configuration, usually read from `creevey.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebDriver grid endpoint
    pub grid_url: String,

    /// Storybook address as seen from the grid
    pub storybook_url: String,

    /// Exported story metadata (JSON or YAML list)
    pub stories_path: PathBuf,

    /// Approved baseline images
    pub screen_dir: PathBuf,

    /// Images and data produced by runs
    pub report_dir: PathBuf,

    /// Extra attempts for a failed test within one run
    pub max_retries: u32,

    /// Share of pixels (0.0 to 1.0) that may differ from the baseline
    pub threshold: f64,

    /// Port of the sync server
    pub port: u16,

    pub timeouts: TimeoutConfig,

    /// Browser name to entry (`true`, a WebDriver browser name, or a table)
    pub browsers: BTreeMap<String, BrowserEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grid_url: "http://localhost:4444/wd/hub".to_string(),
            storybook_url: "http://localhost:6006".to_string(),
            stories_path: PathBuf::from("stories.json"),
            screen_dir: PathBuf::from("images"),
            report_dir: PathBuf::from("report"),
            max_retries: 0,
            threshold: 0.0,
            port: 3000,
            timeouts: TimeoutConfig::default(),
            browsers: [("chrome".to_string(), BrowserEntry::Enabled(true))]
                .into_iter()
                .collect(),
        }
    }
}

/// Bounds for each browser operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub session_ms: u64,
    pub navigate_ms: u64,
    pub select_story_ms: u64,
    pub capture_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            session_ms: 60_000,
            navigate_ms: 10_000,
            select_story_ms: 30_000,
            capture_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn session(&self) -> Duration {
        Duration::from_millis(self.session_ms)
    }

    pub fn navigate(&self) -> Duration {
        Duration::from_millis(self.navigate_ms)
    }

    pub fn select_story(&self) -> Duration {
        Duration::from_millis(self.select_story_ms)
    }

    pub fn capture(&self) -> Duration {
        Duration::from_millis(self.capture_ms)
    }
}

/// Logical viewport size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// A browser entry in its short or full form
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BrowserEntry {
    Enabled(bool),
    Name(String),
    Config(BrowserConfig),
}

/// Full browser settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    pub browser_name: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub grid_url: Option<String>,
    #[serde(default)]
    pub storybook_url: Option<String>,
    #[serde(default)]
    pub viewport: Option<Viewport>,
    /// Extra WebDriver capabilities passed through verbatim
    #[serde(default)]
    pub capabilities: BTreeMap<String, serde_json::Value>,
}

/// Browser settings with global defaults applied
#[derive(Debug, Clone, PartialEq)]
pub struct BrowserSettings {
    /// Key in the `browsers` table; first component of every test path
    pub name: String,
    pub browser_name: String,
    pub limit: usize,
    pub grid_url: String,
    pub storybook_url: String,
    pub viewport: Option<Viewport>,
    pub capabilities: BTreeMap<String, serde_json::Value>,
}

impl BrowserSettings {
    /// WebDriver capabilities object
    pub fn capabilities_json(&self) -> serde_json::Value {
        let mut caps: serde_json::Map<String, serde_json::Value> = self
            .capabilities
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        caps.insert(
            "browserName".to_string(),
            serde_json::Value::String(self.browser_name.clone()),
        );
        serde_json::Value::Object(caps)
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the configuration as TOML, e.g. for worker processes
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Keep only the named browsers; unknown names are an error
    pub fn retain_browsers(&mut self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        if let Some(unknown) = names.iter().find(|n| !self.browsers.contains_key(*n)) {
            return Err(Error::InvalidConfig(format!("unknown browser '{}'", unknown)));
        }
        self.browsers.retain(|name, _| names.contains(name));
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.browsers().is_empty() {
            return Err(Error::InvalidConfig("no browsers enabled".to_string()));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::InvalidConfig(format!(
                "threshold {} is outside 0.0..=1.0",
                self.threshold
            )));
        }
        for (name, entry) in &self.browsers {
            if let BrowserEntry::Config(cfg) = entry {
                if cfg.limit == Some(0) {
                    return Err(Error::InvalidConfig(format!(
                        "browser '{}' has a worker limit of 0",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Enabled browsers with defaults resolved, in name order
    pub fn browsers(&self) -> Vec<BrowserSettings> {
        self.browsers
            .iter()
            .filter_map(|(name, entry)| self.resolve_browser(name, entry))
            .collect()
    }

    pub fn browser(&self, name: &str) -> Option<BrowserSettings> {
        self.browsers
            .get(name)
            .and_then(|entry| self.resolve_browser(name, entry))
    }

    fn resolve_browser(&self, name: &str, entry: &BrowserEntry) -> Option<BrowserSettings> {
        let base = BrowserSettings {
            name: name.to_string(),
            browser_name: name.to_string(),
            limit: 1,
            grid_url: self.grid_url.clone(),
            storybook_url: self.storybook_url.clone(),
            viewport: None,
            capabilities: BTreeMap::new(),
        };
        match entry {
            BrowserEntry::Enabled(false) => None,
            BrowserEntry::Enabled(true) => Some(base),
            BrowserEntry::Name(browser_name) => Some(BrowserSettings {
                browser_name: browser_name.clone(),
                ..base
            }),
            BrowserEntry::Config(cfg) => Some(BrowserSettings {
                browser_name: cfg.browser_name.clone(),
                limit: cfg.limit.unwrap_or(1),
                grid_url: cfg.grid_url.clone().unwrap_or(base.grid_url),
                storybook_url: cfg.storybook_url.clone().unwrap_or(base.storybook_url),
                viewport: cfg.viewport,
                capabilities: cfg.capabilities.clone(),
                name: base.name,
            }),
        }
    }

    /// Persisted run data
    pub fn data_path(&self) -> PathBuf {
        self.report_dir.join("data.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.browsers().len(), 1);
        assert_eq!(config.timeouts.navigate(), Duration::from_secs(10));
    }

    #[test]
    fn test_browser_entry_shapes() {
        let config: Config = toml::from_str(
            r#"
grid_url = "http://grid:4444/wd/hub"
max_retries = 2

[browsers]
chrome = true
ie = false
ff = "firefox"

[browsers.chrome_mobile]
browserName = "chrome"
limit = 3
viewport = { width = 375, height = 667 }
capabilities = { platformName = "linux" }
"#,
        )
        .unwrap();

        let browsers = config.browsers();
        let names: Vec<&str> = browsers.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["chrome", "chrome_mobile", "ff"]);

        let ff = config.browser("ff").unwrap();
        assert_eq!(ff.browser_name, "firefox");
        assert_eq!(ff.grid_url, "http://grid:4444/wd/hub");

        let mobile = config.browser("chrome_mobile").unwrap();
        assert_eq!(mobile.limit, 3);
        assert_eq!(mobile.viewport, Some(Viewport { width: 375, height: 667 }));
        let caps = mobile.capabilities_json();
        assert_eq!(caps["browserName"], "chrome");
        assert_eq!(caps["platformName"], "linux");
        assert!(config.browser("ie").is_none());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("creevey.toml")).unwrap();
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let config: Config = toml::from_str(
            "[browsers.chrome]\nbrowserName = \"chrome\"\nlimit = 0\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_range() {
        let config: Config = toml::from_str("threshold = 0.05\n").unwrap();
        assert_eq!(config.threshold, 0.05);
        assert!(config.validate().is_ok());

        let config: Config = toml::from_str("threshold = 1.5\n").unwrap();
        assert!(config.validate().is_err());
        assert_eq!(Config::default().threshold, 0.0);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report/resolved.toml");
        let mut config: Config = toml::from_str(
            "[browsers]\nchrome = true\nff = \"firefox\"\n\n[browsers.wide]\nbrowserName = \"chrome\"\nlimit = 2\n",
        )
        .unwrap();
        config.retain_browsers(&["ff".into(), "wide".into()]).unwrap();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.threshold, config.threshold);
        assert_eq!(loaded.browsers(), config.browsers());
        assert!(loaded.browser("chrome").is_none());
        assert_eq!(loaded.browser("wide").unwrap().limit, 2);
    }

    #[test]
    fn test_retain_unknown_browser() {
        let mut config = Config::default();
        assert!(config.retain_browsers(&["safari".into()]).is_err());
        assert_eq!(config.browsers().len(), 1);
    }
}
