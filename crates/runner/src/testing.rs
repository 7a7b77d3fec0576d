//! In-memory browser for tests
//!
//! [`FakeConnector`] hands out [`FakeDriver`]s that render a fixed page
//! image and understand the scripts the runner injects. All drivers of one
//! connector share a [`FakeState`] that tests can inspect and tweak.

use async_trait::async_trait;
use image::{imageops, Rgba, RgbaImage};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::capture::{
    encode_png, ELEMENT_RECT_SCRIPT, HIDE_SCROLL_SCRIPT, RESTORE_SCROLL_SCRIPT, SCROLL_TO_SCRIPT,
};
use crate::driver::{Connector, Driver, ElementRef, PointerOrigin, WindowSize};
use crate::error::{RunnerError, RunnerResult};
use crate::session::{
    DISABLE_ANIMATIONS_SCRIPT, HAS_ELEMENT_SCRIPT, INNER_SIZE_SCRIPT, RESET_SCROLL_SCRIPT,
    ROOT_SELECTOR, SELECT_STORY_SCRIPT,
};
use crate::steps::FOCUS_SCRIPT;

/// Element box in document coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FakeElement {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// Observable browser state
#[derive(Debug, Clone)]
pub struct FakeState {
    /// Full document rendering
    pub page: RgbaImage,
    pub viewport: WindowSize,
    /// Outer window minus viewport
    pub chrome: WindowSize,
    pub elements: HashMap<String, FakeElement>,
    pub has_root: bool,
    pub harness: bool,
    /// Upcoming story selections that report an error
    pub select_failures: usize,
    /// Upcoming connection attempts that fail
    pub connect_failures: usize,

    pub scroll: (u32, u32),
    pub scroll_hidden: bool,
    pub scroll_restores: usize,
    pub styles: Vec<String>,
    pub visited: Vec<String>,
    pub selected: Vec<String>,
    pub clicks: Vec<String>,
    pub typed: Vec<(String, String)>,
    pub screenshots: usize,
    pub sessions: usize,
    pub quits: usize,
}

impl FakeState {
    pub fn new(page: RgbaImage, viewport: WindowSize) -> Self {
        Self {
            page,
            viewport,
            chrome: WindowSize {
                width: 0,
                height: 80,
            },
            elements: HashMap::new(),
            has_root: true,
            harness: true,
            select_failures: 0,
            connect_failures: 0,
            scroll: (0, 0),
            scroll_hidden: false,
            scroll_restores: 0,
            styles: Vec::new(),
            visited: Vec::new(),
            selected: Vec::new(),
            clicks: Vec::new(),
            typed: Vec::new(),
            screenshots: 0,
            sessions: 0,
            quits: 0,
        }
    }

    pub fn with_element(mut self, selector: &str, element: FakeElement) -> Self {
        self.elements.insert(selector.to_string(), element);
        self
    }

    /// What the viewport shows at the current scroll position
    pub fn viewport_image(&self) -> RgbaImage {
        self.crop(
            self.scroll.0,
            self.scroll.1,
            self.viewport.width,
            self.viewport.height,
        )
    }

    pub fn element_image(&self, selector: &str) -> Option<RgbaImage> {
        let e = self.elements.get(selector)?;
        Some(self.crop(
            e.left.round() as u32,
            e.top.round() as u32,
            e.width.round() as u32,
            e.height.round() as u32,
        ))
    }

    /// Region of the page; parts outside it are transparent
    fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> RgbaImage {
        let mut out = RgbaImage::new(width, height);
        let visible = imageops::crop_imm(&self.page, x, y, width, height).to_image();
        imageops::replace(&mut out, &visible, 0, 0);
        out
    }

    fn scroll_to(&mut self, x: f64, y: f64) {
        let max_x = self.page.width().saturating_sub(self.viewport.width);
        let max_y = self.page.height().saturating_sub(self.viewport.height);
        self.scroll = (
            (x.max(0.0).round() as u32).min(max_x),
            (y.max(0.0).round() as u32).min(max_y),
        );
    }

    fn run_script(&mut self, script: &str, args: &[Value]) -> RunnerResult<Value> {
        let arg = |i: usize| args.get(i).and_then(Value::as_str).unwrap_or_default().to_string();

        let value = if script == DISABLE_ANIMATIONS_SCRIPT {
            let id = arg(0);
            if self.styles.contains(&id) {
                json!(false)
            } else {
                self.styles.push(id);
                json!(true)
            }
        } else if script == INNER_SIZE_SCRIPT {
            json!({ "width": self.viewport.width, "height": self.viewport.height })
        } else if script == HAS_ELEMENT_SCRIPT {
            let selector = arg(0);
            json!(if selector == ROOT_SELECTOR {
                self.has_root
            } else {
                self.elements.contains_key(&selector)
            })
        } else if script == RESET_SCROLL_SCRIPT {
            self.scroll = (0, 0);
            Value::Null
        } else if script == HIDE_SCROLL_SCRIPT {
            self.scroll_hidden = true;
            self.scroll = (0, 0);
            Value::Null
        } else if script == RESTORE_SCROLL_SCRIPT {
            if self.scroll_hidden {
                self.scroll_hidden = false;
                self.scroll_restores += 1;
            }
            Value::Null
        } else if script == ELEMENT_RECT_SCRIPT {
            let rect = self.elements.get(&arg(0)).map(|e| {
                json!({
                    "left": e.left - self.scroll.0 as f64,
                    "top": e.top - self.scroll.1 as f64,
                    "width": e.width,
                    "height": e.height,
                })
            });
            json!({
                "elementRect": rect,
                "windowSize": { "width": self.viewport.width, "height": self.viewport.height },
            })
        } else if script == SCROLL_TO_SCRIPT {
            let coord = |i: usize| args.get(i).and_then(Value::as_f64).unwrap_or(0.0);
            self.scroll_to(coord(0), coord(1));
            Value::Null
        } else if script == FOCUS_SCRIPT {
            json!(self.elements.contains_key(&arg(0)))
        } else {
            return Err(RunnerError::Script(format!(
                "unsupported script: {}",
                script.trim()
            )));
        };
        Ok(value)
    }
}

/// Page image with a distinct colour at every pixel
pub fn gradient(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, ((x / 256 + y / 256) % 256) as u8, 255])
    })
}

/// PNG bytes of an image
pub fn png(image: RgbaImage) -> Vec<u8> {
    encode_png(image).unwrap_or_default()
}

pub struct FakeDriver {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDriver {
    pub fn new(state: Arc<Mutex<FakeState>>) -> Self {
        Self { state }
    }

    fn element(&self, element: &ElementRef) -> RunnerResult<()> {
        if self.state.lock().elements.contains_key(&element.0) {
            Ok(())
        } else {
            Err(RunnerError::WebDriver {
                error: "stale element reference".to_string(),
                message: element.0.clone(),
            })
        }
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn navigate(&self, url: &str) -> RunnerResult<()> {
        self.state.lock().visited.push(url.to_string());
        Ok(())
    }

    async fn execute(&self, script: &str, args: Vec<Value>) -> RunnerResult<Value> {
        self.state.lock().run_script(script, &args)
    }

    async fn execute_async(&self, script: &str, args: Vec<Value>) -> RunnerResult<Value> {
        if script != SELECT_STORY_SCRIPT {
            return Err(RunnerError::Script("unsupported async script".to_string()));
        }
        let mut state = self.state.lock();
        if !state.harness {
            return Ok(json!({ "error": "story harness is not loaded on the page" }));
        }
        if state.select_failures > 0 {
            state.select_failures -= 1;
            return Ok(json!({ "error": "story failed to render" }));
        }
        let id = args.first().and_then(Value::as_str).unwrap_or_default();
        state.selected.push(id.to_string());
        Ok(json!({ "ok": true }))
    }

    async fn set_script_timeout(&self, _timeout: Duration) -> RunnerResult<()> {
        Ok(())
    }

    async fn screenshot(&self) -> RunnerResult<Vec<u8>> {
        let mut state = self.state.lock();
        state.screenshots += 1;
        encode_png(state.viewport_image())
    }

    async fn find_element(&self, selector: &str) -> RunnerResult<ElementRef> {
        if self.state.lock().elements.contains_key(selector) {
            Ok(ElementRef(selector.to_string()))
        } else {
            Err(RunnerError::Capture(format!("element '{}' not found", selector)))
        }
    }

    async fn element_screenshot(&self, element: &ElementRef) -> RunnerResult<Vec<u8>> {
        let mut state = self.state.lock();
        state.screenshots += 1;
        let image = state
            .element_image(&element.0)
            .ok_or_else(|| RunnerError::Capture(format!("element '{}' not found", element.0)))?;
        encode_png(image)
    }

    async fn click(&self, element: &ElementRef) -> RunnerResult<()> {
        self.element(element)?;
        self.state.lock().clicks.push(element.0.clone());
        Ok(())
    }

    async fn clear(&self, element: &ElementRef) -> RunnerResult<()> {
        self.element(element)
    }

    async fn send_keys(&self, element: &ElementRef, text: &str) -> RunnerResult<()> {
        self.element(element)?;
        self.state
            .lock()
            .typed
            .push((element.0.clone(), text.to_string()));
        Ok(())
    }

    async fn move_pointer(&self, origin: PointerOrigin, _x: i64, _y: i64) -> RunnerResult<()> {
        match origin {
            PointerOrigin::Viewport => Ok(()),
            PointerOrigin::Element(element) => self.element(&element),
        }
    }

    async fn press_key(&self, _key: &str) -> RunnerResult<()> {
        Ok(())
    }

    async fn window_size(&self) -> RunnerResult<WindowSize> {
        let state = self.state.lock();
        Ok(WindowSize {
            width: state.viewport.width + state.chrome.width,
            height: state.viewport.height + state.chrome.height,
        })
    }

    async fn set_window_size(&self, size: WindowSize) -> RunnerResult<()> {
        let mut state = self.state.lock();
        state.viewport = WindowSize {
            width: size.width.saturating_sub(state.chrome.width),
            height: size.height.saturating_sub(state.chrome.height),
        };
        Ok(())
    }

    async fn quit(&self) -> RunnerResult<()> {
        self.state.lock().quits += 1;
        Ok(())
    }
}

/// Connector whose sessions all drive the same [`FakeState`]
#[derive(Clone)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub fn new(state: FakeState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn state(&self) -> Arc<Mutex<FakeState>> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, grid_url: &str, _capabilities: &Value) -> RunnerResult<Box<dyn Driver>> {
        let mut state = self.state.lock();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(RunnerError::Session(format!("grid {} unreachable", grid_url)));
        }
        state.sessions += 1;
        Ok(Box::new(FakeDriver::new(Arc::clone(&self.state))))
    }
}
