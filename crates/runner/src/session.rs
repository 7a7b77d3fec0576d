//! Browser session lifecycle
//!
//! A [`BrowserSession`] wraps one driver and knows how to size the window,
//! load the storybook iframe, make rendering deterministic and ask the
//! in-page harness to switch stories. Every operation that waits on the page
//! is bounded by the configured timeouts.

use creevey_common::config::TimeoutConfig;
use creevey_common::BrowserSettings;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::capture;
use crate::driver::{Connector, Driver, PointerOrigin, WindowSize};
use crate::error::{RunnerError, RunnerResult};

/// DOM anchor the storybook iframe renders stories into
pub const ROOT_SELECTOR: &str = "#root";

pub const DISABLE_ANIMATIONS_STYLE_ID: &str = "creevey-disable-animations";

const DISABLE_ANIMATIONS_CSS: &str = "
*,
*:hover,
*::before,
*::after {
  animation-delay: -0.0001ms !important;
  animation-duration: 0s !important;
  animation-play-state: paused !important;
  cursor: none !important;
  caret-color: transparent !important;
  transition: 0s !important;
}
";

pub(crate) const DISABLE_ANIMATIONS_SCRIPT: &str = r#"
if (document.getElementById(arguments[0])) {
  return false;
}
var style = document.createElement('style');
style.setAttribute('id', arguments[0]);
style.setAttribute('type', 'text/css');
style.appendChild(document.createTextNode(arguments[1]));
document.head.appendChild(style);
return true;
"#;

pub(crate) const INNER_SIZE_SCRIPT: &str =
    "return { width: window.innerWidth, height: window.innerHeight };";

pub(crate) const HAS_ELEMENT_SCRIPT: &str = "return document.querySelector(arguments[0]) !== null;";

pub(crate) const RESET_SCROLL_SCRIPT: &str = "window.scrollTo(0, 0);";

pub(crate) const SELECT_STORY_SCRIPT: &str = r#"
var callback = arguments[arguments.length - 1];
if (typeof window.__CREEVEY_SELECT_STORY__ !== 'function') {
  callback({ error: 'story harness is not loaded on the page' });
  return;
}
try {
  window.__CREEVEY_SELECT_STORY__(arguments[0], arguments[1], arguments[2], function (error) {
    callback(error ? { error: String(error) } : { ok: true });
  });
} catch (e) {
  callback({ error: String(e) });
}
"#;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Story coordinates understood by the in-page harness
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryRef {
    pub id: String,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct InnerSize {
    width: u32,
    height: u32,
}

/// Window size that yields `viewport` as the inner size, given the current
/// outer and inner sizes
pub fn compensated_window(viewport: creevey_common::Viewport, window: WindowSize, inner: WindowSize) -> WindowSize {
    let chrome_w = window.width.saturating_sub(inner.width);
    let chrome_h = window.height.saturating_sub(inner.height);
    WindowSize {
        width: viewport.width + chrome_w,
        height: viewport.height + chrome_h,
    }
}

pub struct BrowserSession {
    driver: Box<dyn Driver>,
    settings: BrowserSettings,
    timeouts: TimeoutConfig,
}

impl BrowserSession {
    /// Open a session on the browser's grid
    pub async fn open(
        connector: &dyn Connector,
        settings: &BrowserSettings,
        timeouts: &TimeoutConfig,
    ) -> RunnerResult<Self> {
        info!("Opening {} session on {}", settings.name, settings.grid_url);
        let capabilities = settings.capabilities_json();
        let driver = timeout(
            timeouts.session(),
            connector.connect(&settings.grid_url, &capabilities),
        )
        .await
        .map_err(|_| {
            RunnerError::Session(format!(
                "no session from {} within {:?}",
                settings.grid_url,
                timeouts.session()
            ))
        })??;

        Ok(Self {
            driver,
            settings: settings.clone(),
            timeouts: timeouts.clone(),
        })
    }

    /// Open, size the window and load the storybook page
    pub async fn start(
        connector: &dyn Connector,
        settings: &BrowserSettings,
        timeouts: &TimeoutConfig,
    ) -> RunnerResult<Self> {
        let session = Self::open(connector, settings, timeouts).await?;
        let ready = async {
            session
                .driver
                .set_script_timeout(session.timeouts.select_story())
                .await?;
            session.configure().await?;
            session.open_storybook().await
        }
        .await;
        match ready {
            Ok(()) => Ok(session),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.settings
    }

    /// Resize the window so the page gets the configured viewport
    pub async fn configure(&self) -> RunnerResult<()> {
        let Some(viewport) = self.settings.viewport else {
            return Ok(());
        };
        let window = self.driver.window_size().await?;
        let inner: InnerSize =
            serde_json::from_value(self.driver.execute(INNER_SIZE_SCRIPT, Vec::new()).await?)?;
        let target = compensated_window(
            viewport,
            window,
            WindowSize {
                width: inner.width,
                height: inner.height,
            },
        );
        debug!(
            "Resizing {} window to {}x{} for a {}x{} viewport",
            self.settings.name, target.width, target.height, viewport.width, viewport.height
        );
        self.driver.set_window_size(target).await
    }

    /// Disable animations, transitions and the caret. Safe to call repeatedly.
    pub async fn prepare(&self) -> RunnerResult<()> {
        let injected = self
            .driver
            .execute(
                DISABLE_ANIMATIONS_SCRIPT,
                vec![json!(DISABLE_ANIMATIONS_STYLE_ID), json!(DISABLE_ANIMATIONS_CSS)],
            )
            .await?;
        if injected.as_bool() == Some(true) {
            debug!("Disabled animations on {}", self.settings.name);
        }
        Ok(())
    }

    /// Load `url` and wait for the story root to appear
    pub async fn navigate(&self, url: &str) -> RunnerResult<()> {
        let limit = self.timeouts.navigate();
        let load = async {
            self.driver.navigate(url).await?;
            self.wait_for(ROOT_SELECTOR).await
        };
        match timeout(limit, load).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RunnerError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(RunnerError::Navigation {
                url: url.to_string(),
                reason: format!("{} did not appear within {:?}", ROOT_SELECTOR, limit),
            }),
        }
    }

    pub async fn open_storybook(&self) -> RunnerResult<()> {
        let url = format!(
            "{}/iframe.html",
            self.settings.storybook_url.trim_end_matches('/')
        );
        self.navigate(&url).await?;
        self.prepare().await
    }

    /// Poll until `selector` matches an element. Unbounded; callers add the timeout.
    pub async fn wait_for(&self, selector: &str) -> RunnerResult<()> {
        loop {
            let found = self
                .driver
                .execute(HAS_ELEMENT_SCRIPT, vec![json!(selector)])
                .await?;
            if found.as_bool() == Some(true) {
                return Ok(());
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Ask the page harness to render `story` and wait for its acknowledgement
    pub async fn select_story(&self, story: &StoryRef) -> RunnerResult<()> {
        self.reset_pointer().await?;
        let limit = self.timeouts.select_story();
        let reply = self
            .bounded(
                limit,
                &format!("story {}", story.id),
                self.driver.execute_async(
                    SELECT_STORY_SCRIPT,
                    vec![json!(story.id), json!(story.kind), json!(story.name)],
                ),
            )
            .await?;

        match reply.get("error").and_then(|e| e.as_str()) {
            Some(error) => Err(RunnerError::Script(format!(
                "can't select story {}: {}",
                story.id, error
            ))),
            None => Ok(()),
        }
    }

    /// Scroll to the top and park the pointer at the viewport origin
    async fn reset_pointer(&self) -> RunnerResult<()> {
        self.driver.execute(RESET_SCROLL_SCRIPT, Vec::new()).await?;
        self.driver
            .move_pointer(PointerOrigin::Viewport, 0, 0)
            .await
    }

    /// Screenshot of the viewport or of `selector`
    pub async fn capture(&self, selector: Option<&str>) -> RunnerResult<Vec<u8>> {
        let limit = self.timeouts.capture();
        let shot = timeout(limit, capture::capture(self.driver(), selector)).await;
        match shot {
            Ok(result) => result,
            Err(_) => {
                // the capture future was dropped mid-way, so its guard never ran
                capture::restore_scroll(self.driver()).await;
                Err(RunnerError::Timeout(format!("screenshot within {:?}", limit)))
            }
        }
    }

    async fn bounded<T>(
        &self,
        limit: Duration,
        what: &str,
        operation: impl Future<Output = RunnerResult<T>>,
    ) -> RunnerResult<T> {
        timeout(limit, operation)
            .await
            .map_err(|_| RunnerError::Timeout(format!("{} within {:?}", what, limit)))?
    }

    /// Delete the remote session
    pub async fn close(self) {
        info!("Closing {} session", self.settings.name);
        if let Err(e) = self.driver.quit().await {
            warn!("Failed to close {} session: {}", self.settings.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creevey_common::Viewport;

    #[test]
    fn test_window_compensates_for_browser_chrome() {
        let target = compensated_window(
            Viewport {
                width: 1024,
                height: 720,
            },
            WindowSize {
                width: 1280,
                height: 800,
            },
            WindowSize {
                width: 1264,
                height: 700,
            },
        );
        assert_eq!(
            target,
            WindowSize {
                width: 1040,
                height: 820
            }
        );
    }
}
