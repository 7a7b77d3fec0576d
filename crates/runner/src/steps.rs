//! Declarative story tests
//!
//! A story may carry named tests, each a list of steps run against the
//! rendered story before (or between) screenshots:
//!
//! ```yaml
//! tests:
//!   hover:
//!     - action: hover
//!       selector: "button"
//!     - action: screenshot
//!   opened:
//!     - action: click
//!       selector: "button"
//!     - action: screenshot
//!       name: opened
//!       selector: ".popup"
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::driver::PointerOrigin;
use crate::error::{RunnerError, RunnerResult};
use crate::session::BrowserSession;

pub(crate) const FOCUS_SCRIPT: &str = r#"
var element = document.querySelector(arguments[0]);
if (!element) {
  return false;
}
element.focus();
return true;
"#;

/// A single step of a story test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StoryStep {
    Click {
        selector: String,
    },

    Hover {
        selector: String,
    },

    Focus {
        selector: String,
    },

    /// Type into an input
    Fill {
        selector: String,
        value: String,
        #[serde(default)]
        clear_first: bool,
    },

    /// Press a key, on an element if a selector is given
    Press {
        #[serde(default)]
        selector: Option<String>,
        key: String,
    },

    /// Wait for an element to appear
    Wait {
        selector: String,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
    },

    Sleep {
        ms: u64,
    },

    /// Run a script body in the page
    Evaluate {
        script: String,
        #[serde(default)]
        expected: Option<Value>,
    },

    /// Capture an image. Unnamed screenshots are named after the browser.
    Screenshot {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        selector: Option<String>,
    },
}

fn default_wait_timeout() -> u64 {
    5000
}

impl StoryStep {
    pub fn name(&self) -> String {
        match self {
            StoryStep::Click { selector } => format!("click:{}", selector),
            StoryStep::Hover { selector } => format!("hover:{}", selector),
            StoryStep::Focus { selector } => format!("focus:{}", selector),
            StoryStep::Fill { selector, .. } => format!("fill:{}", selector),
            StoryStep::Press { key, .. } => format!("press:{}", key),
            StoryStep::Wait { selector, .. } => format!("wait:{}", selector),
            StoryStep::Sleep { ms } => format!("sleep:{}ms", ms),
            StoryStep::Evaluate { .. } => "evaluate".to_string(),
            StoryStep::Screenshot { name, .. } => {
                format!("screenshot:{}", name.as_deref().unwrap_or("<default>"))
            }
        }
    }
}

/// A named test of one story
#[derive(Debug, Clone, PartialEq)]
pub struct StoryTest {
    pub name: String,
    pub steps: Vec<StoryStep>,
}

/// Parse the raw `tests` parameter of a story: a map of test name to steps.
///
/// Screenshot names must be unique within a test; at most one may be unnamed.
pub fn parse_story_tests(raw: &Value) -> Result<Vec<StoryTest>, String> {
    let Value::Object(map) = raw else {
        return Err("tests must be a map of test name to steps".to_string());
    };

    let mut tests = Vec::with_capacity(map.len());
    for (name, steps) in map {
        if name.trim().is_empty() {
            return Err("test name must not be empty".to_string());
        }
        let steps: Vec<StoryStep> = serde_json::from_value(steps.clone())
            .map_err(|e| format!("test '{}': {}", name, e))?;

        let mut seen = HashSet::new();
        for step in &steps {
            if let StoryStep::Screenshot { name: image, .. } = step {
                if !seen.insert(image.clone()) {
                    return Err(format!(
                        "test '{}': duplicate screenshot '{}'",
                        name,
                        image.as_deref().unwrap_or("<default>")
                    ));
                }
            }
        }

        tests.push(StoryTest {
            name: name.clone(),
            steps,
        });
    }
    Ok(tests)
}

impl StoryTest {
    /// An unnamed screenshot is saved as `default_image`, so no named
    /// screenshot of the same test may use that name too
    pub fn check_default_image(&self, default_image: &str) -> Result<(), String> {
        let shots = self.steps.iter().filter_map(|step| match step {
            StoryStep::Screenshot { name, .. } => Some(name.as_deref()),
            _ => None,
        });
        let (mut unnamed, mut clash) = (false, false);
        for name in shots {
            match name {
                None => unnamed = true,
                Some(name) => clash |= name == default_image,
            }
        }
        if unnamed && clash {
            return Err(format!(
                "test '{}': screenshot '{}' collides with the unnamed screenshot",
                self.name, default_image
            ));
        }
        Ok(())
    }
}

/// Runs steps against a session and collects named screenshots
pub struct StepRunner<'a> {
    session: &'a BrowserSession,
    default_image: &'a str,
    capture_element: Option<&'a str>,
}

impl<'a> StepRunner<'a> {
    pub fn new(
        session: &'a BrowserSession,
        default_image: &'a str,
        capture_element: Option<&'a str>,
    ) -> Self {
        Self {
            session,
            default_image,
            capture_element,
        }
    }

    /// Execute all steps. A test without screenshot steps captures once at the end.
    pub async fn run(&self, steps: &[StoryStep]) -> RunnerResult<Vec<(String, Vec<u8>)>> {
        let mut images = Vec::new();
        for step in steps {
            debug!("Executing step: {}", step.name());
            if let Some(image) = self.execute(step).await? {
                images.push(image);
            }
        }
        if images.is_empty() {
            let shot = self.session.capture(self.capture_element).await?;
            images.push((self.default_image.to_string(), shot));
        }
        Ok(images)
    }

    async fn execute(&self, step: &StoryStep) -> RunnerResult<Option<(String, Vec<u8>)>> {
        let driver = self.session.driver();
        match step {
            StoryStep::Click { selector } => {
                let element = driver.find_element(selector).await?;
                driver.click(&element).await?;
            }
            StoryStep::Hover { selector } => {
                let element = driver.find_element(selector).await?;
                driver
                    .move_pointer(PointerOrigin::Element(element), 0, 0)
                    .await?;
            }
            StoryStep::Focus { selector } => {
                let found = driver.execute(FOCUS_SCRIPT, vec![json!(selector)]).await?;
                if found.as_bool() != Some(true) {
                    return Err(RunnerError::Capture(format!(
                        "element '{}' not found",
                        selector
                    )));
                }
            }
            StoryStep::Fill {
                selector,
                value,
                clear_first,
            } => {
                let element = driver.find_element(selector).await?;
                if *clear_first {
                    driver.clear(&element).await?;
                }
                driver.send_keys(&element, value).await?;
            }
            StoryStep::Press { selector, key } => match selector {
                Some(selector) => {
                    let element = driver.find_element(selector).await?;
                    driver
                        .send_keys(&element, &crate::webdriver::key_code(key))
                        .await?;
                }
                None => driver.press_key(key).await?,
            },
            StoryStep::Wait {
                selector,
                timeout_ms,
            } => {
                let limit = Duration::from_millis(*timeout_ms);
                timeout(limit, self.session.wait_for(selector))
                    .await
                    .map_err(|_| {
                        RunnerError::Timeout(format!("{} within {:?}", selector, limit))
                    })??;
            }
            StoryStep::Sleep { ms } => sleep(Duration::from_millis(*ms)).await,
            StoryStep::Evaluate { script, expected } => {
                let value = driver.execute(script, Vec::new()).await?;
                if let Some(expected) = expected {
                    if &value != expected {
                        return Err(RunnerError::Script(format!(
                            "expected {}, got {}",
                            expected, value
                        )));
                    }
                }
            }
            StoryStep::Screenshot { name, selector } => {
                let selector = selector.as_deref().or(self.capture_element);
                let shot = self.session.capture(selector).await?;
                let name = name.clone().unwrap_or_else(|| self.default_image.to_string());
                return Ok(Some((name, shot)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_story_tests_keeps_order() {
        let raw: Value = serde_yaml::from_str(
            r#"
open:
  - action: click
    selector: button
  - action: screenshot
    name: opened
idle:
  - action: screenshot
"#,
        )
        .unwrap();
        let tests = parse_story_tests(&raw).unwrap();
        let names: Vec<&str> = tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["open", "idle"]);
        assert_eq!(
            tests[0].steps[0],
            StoryStep::Click {
                selector: "button".into()
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_action() {
        let raw = json!({ "broken": [{ "action": "teleport" }] });
        let err = parse_story_tests(&raw).unwrap_err();
        assert!(err.contains("broken"));
    }

    #[test]
    fn test_parse_rejects_duplicate_screenshots() {
        let raw = json!({
            "twice": [{ "action": "screenshot" }, { "action": "screenshot" }]
        });
        assert!(parse_story_tests(&raw).is_err());
    }

    #[test]
    fn test_parse_rejects_non_map() {
        assert!(parse_story_tests(&json!(["click"])).is_err());
        assert!(parse_story_tests(&json!({ "": [] })).is_err());
    }
}
