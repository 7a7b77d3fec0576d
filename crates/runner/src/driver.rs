//! Browser automation capability
//!
//! Everything the runner does to a browser goes through [`Driver`]. The
//! production implementation speaks the W3C WebDriver protocol
//! ([`crate::webdriver`]); tests use [`crate::testing::FakeDriver`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::RunnerResult;

/// Opaque handle of an element found on the page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef(pub String);

/// Outer window size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

/// Reference point of a pointer move
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerOrigin {
    Viewport,
    Element(ElementRef),
}

#[async_trait]
pub trait Driver: Send + Sync {
    async fn navigate(&self, url: &str) -> RunnerResult<()>;

    /// Run a synchronous script body; `arguments` holds `args`
    async fn execute(&self, script: &str, args: Vec<Value>) -> RunnerResult<Value>;

    /// Run an asynchronous script body; the completion callback is the last argument
    async fn execute_async(&self, script: &str, args: Vec<Value>) -> RunnerResult<Value>;

    async fn set_script_timeout(&self, timeout: Duration) -> RunnerResult<()>;

    /// PNG of the current viewport
    async fn screenshot(&self) -> RunnerResult<Vec<u8>>;

    async fn find_element(&self, selector: &str) -> RunnerResult<ElementRef>;

    /// PNG of one element
    async fn element_screenshot(&self, element: &ElementRef) -> RunnerResult<Vec<u8>>;

    async fn click(&self, element: &ElementRef) -> RunnerResult<()>;

    async fn clear(&self, element: &ElementRef) -> RunnerResult<()>;

    async fn send_keys(&self, element: &ElementRef, text: &str) -> RunnerResult<()>;

    async fn move_pointer(&self, origin: PointerOrigin, x: i64, y: i64) -> RunnerResult<()>;

    /// Press and release a key; named keys such as `Enter` are accepted
    async fn press_key(&self, key: &str) -> RunnerResult<()>;

    async fn window_size(&self) -> RunnerResult<WindowSize>;

    async fn set_window_size(&self, size: WindowSize) -> RunnerResult<()>;

    async fn quit(&self) -> RunnerResult<()>;
}

/// Opens new driver sessions against a grid
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, grid_url: &str, capabilities: &Value) -> RunnerResult<Box<dyn Driver>>;
}
