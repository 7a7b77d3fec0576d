//! W3C WebDriver client
//!
//! A thin HTTP client over the WebDriver wire protocol, enough for what the
//! runner needs: sessions, navigation, script execution, screenshots,
//! element lookup, pointer and key actions and window sizing.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::driver::{Connector, Driver, ElementRef, PointerOrigin, WindowSize};
use crate::error::{RunnerError, RunnerResult};

/// Key under which WebDriver returns element references
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Opens sessions over HTTP
#[derive(Clone)]
pub struct WebDriverConnector {
    client: Client,
}

impl WebDriverConnector {
    pub fn new() -> RunnerResult<Self> {
        let client = Client::builder().build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Connector for WebDriverConnector {
    async fn connect(&self, grid_url: &str, capabilities: &Value) -> RunnerResult<Box<dyn Driver>> {
        let grid_url = grid_url.trim_end_matches('/');
        let body = json!({
            "capabilities": { "alwaysMatch": capabilities },
            "desiredCapabilities": capabilities,
        });

        let response = self
            .client
            .post(format!("{}/session", grid_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| RunnerError::Session(format!("grid {} unreachable: {}", grid_url, e)))?;

        let body = read_body(response)
            .await
            .map_err(|e| RunnerError::Session(e.to_string()))?;

        // W3C puts the id under `value`, the legacy JSON wire protocol at the top level
        let session_id = body["value"]["sessionId"]
            .as_str()
            .or_else(|| body["sessionId"].as_str())
            .ok_or_else(|| RunnerError::Session("grid returned no session id".to_string()))?
            .to_string();

        info!("Opened WebDriver session {} on {}", session_id, grid_url);

        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            base: format!("{}/session/{}", grid_url, session_id),
        }))
    }
}

/// One open WebDriver session
pub struct WebDriverSession {
    client: Client,
    base: String,
}

impl WebDriverSession {
    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> RunnerResult<Value> {
        let url = format!("{}{}", self.base, path);
        debug!("WebDriver {} {}", method, url);

        let is_post = method == Method::POST;
        let mut request = self.client.request(method, &url);
        match body {
            Some(body) => request = request.json(&body),
            None if is_post => request = request.json(&json!({})),
            None => {}
        }

        let body = read_body(request.send().await?).await?;
        Ok(body.get("value").cloned().unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> RunnerResult<Value> {
        self.command(Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: Value) -> RunnerResult<Value> {
        self.command(Method::POST, path, Some(body)).await
    }

    async fn actions(&self, actions: Value) -> RunnerResult<()> {
        self.post("/actions", json!({ "actions": [actions] })).await?;
        Ok(())
    }
}

/// Parse a response body and turn protocol errors into [`RunnerError::WebDriver`]
async fn read_body(response: reqwest::Response) -> RunnerResult<Value> {
    let status = response.status();
    let body: Value = response.json().await?;

    if !status.is_success() {
        let value = &body["value"];
        return Err(RunnerError::WebDriver {
            error: value["error"].as_str().unwrap_or("unknown error").to_string(),
            message: value["message"]
                .as_str()
                .unwrap_or_else(|| status.as_str())
                .to_string(),
        });
    }

    Ok(body)
}

fn decode_png(value: Value) -> RunnerResult<Vec<u8>> {
    let encoded = value
        .as_str()
        .ok_or_else(|| RunnerError::Capture("screenshot is not a string".to_string()))?;
    Ok(STANDARD.decode(encoded)?)
}

fn element_json(element: &ElementRef) -> Value {
    json!({ ELEMENT_KEY: element.0 })
}

/// WebDriver code point for a named key; other keys are sent as typed
pub fn key_code(key: &str) -> String {
    let code = match key {
        "Backspace" => '\u{E003}',
        "Tab" => '\u{E004}',
        "Enter" => '\u{E007}',
        "Shift" => '\u{E008}',
        "Control" => '\u{E009}',
        "Alt" => '\u{E00A}',
        "Escape" => '\u{E00C}',
        "Space" => ' ',
        "PageUp" => '\u{E00E}',
        "PageDown" => '\u{E00F}',
        "End" => '\u{E010}',
        "Home" => '\u{E011}',
        "ArrowLeft" => '\u{E012}',
        "ArrowUp" => '\u{E013}',
        "ArrowRight" => '\u{E014}',
        "ArrowDown" => '\u{E015}',
        "Delete" => '\u{E017}',
        "Meta" => '\u{E03D}',
        other => return other.to_string(),
    };
    code.to_string()
}

#[async_trait]
impl Driver for WebDriverSession {
    async fn navigate(&self, url: &str) -> RunnerResult<()> {
        self.post("/url", json!({ "url": url })).await?;
        Ok(())
    }

    async fn execute(&self, script: &str, args: Vec<Value>) -> RunnerResult<Value> {
        self.post("/execute/sync", json!({ "script": script, "args": args }))
            .await
            .map_err(into_script_error)
    }

    async fn execute_async(&self, script: &str, args: Vec<Value>) -> RunnerResult<Value> {
        self.post("/execute/async", json!({ "script": script, "args": args }))
            .await
            .map_err(into_script_error)
    }

    async fn set_script_timeout(&self, timeout: Duration) -> RunnerResult<()> {
        self.post("/timeouts", json!({ "script": timeout.as_millis() as u64 }))
            .await?;
        Ok(())
    }

    async fn screenshot(&self) -> RunnerResult<Vec<u8>> {
        decode_png(self.get("/screenshot").await?)
    }

    async fn find_element(&self, selector: &str) -> RunnerResult<ElementRef> {
        let value = self
            .post("/element", json!({ "using": "css selector", "value": selector }))
            .await
            .map_err(|e| match e {
                RunnerError::WebDriver { error, .. } if error == "no such element" => {
                    RunnerError::Capture(format!("element '{}' not found", selector))
                }
                other => other,
            })?;

        value[ELEMENT_KEY]
            .as_str()
            .map(|id| ElementRef(id.to_string()))
            .ok_or_else(|| RunnerError::Capture(format!("element '{}' not found", selector)))
    }

    async fn element_screenshot(&self, element: &ElementRef) -> RunnerResult<Vec<u8>> {
        decode_png(self.get(&format!("/element/{}/screenshot", element.0)).await?)
    }

    async fn click(&self, element: &ElementRef) -> RunnerResult<()> {
        self.post(&format!("/element/{}/click", element.0), json!({}))
            .await?;
        Ok(())
    }

    async fn clear(&self, element: &ElementRef) -> RunnerResult<()> {
        self.post(&format!("/element/{}/clear", element.0), json!({}))
            .await?;
        Ok(())
    }

    async fn send_keys(&self, element: &ElementRef, text: &str) -> RunnerResult<()> {
        self.post(
            &format!("/element/{}/value", element.0),
            json!({ "text": text }),
        )
        .await?;
        Ok(())
    }

    async fn move_pointer(&self, origin: PointerOrigin, x: i64, y: i64) -> RunnerResult<()> {
        let origin = match origin {
            PointerOrigin::Viewport => json!("viewport"),
            PointerOrigin::Element(element) => element_json(&element),
        };
        self.actions(json!({
            "type": "pointer",
            "id": "mouse",
            "parameters": { "pointerType": "mouse" },
            "actions": [
                { "type": "pointerMove", "duration": 0, "origin": origin, "x": x, "y": y }
            ],
        }))
        .await
    }

    async fn press_key(&self, key: &str) -> RunnerResult<()> {
        let code = key_code(key);
        self.actions(json!({
            "type": "key",
            "id": "keyboard",
            "actions": [
                { "type": "keyDown", "value": code },
                { "type": "keyUp", "value": code },
            ],
        }))
        .await
    }

    async fn window_size(&self) -> RunnerResult<WindowSize> {
        let rect = self.get("/window/rect").await?;
        Ok(serde_json::from_value(rect)?)
    }

    async fn set_window_size(&self, size: WindowSize) -> RunnerResult<()> {
        self.post(
            "/window/rect",
            json!({ "width": size.width, "height": size.height }),
        )
        .await?;
        Ok(())
    }

    async fn quit(&self) -> RunnerResult<()> {
        self.command(Method::DELETE, "", None).await?;
        Ok(())
    }
}

fn into_script_error(error: RunnerError) -> RunnerError {
    match error {
        RunnerError::WebDriver { error, message } if error == "javascript error" => {
            RunnerError::Script(message)
        }
        RunnerError::WebDriver { error, .. } if error == "script timeout" => {
            RunnerError::Timeout("page script".to_string())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_keys_map_to_code_points() {
        assert_eq!(key_code("Enter"), "\u{E007}");
        assert_eq!(key_code("ArrowDown"), "\u{E015}");
        assert_eq!(key_code("a"), "a");
    }

    #[test]
    fn test_script_errors_are_reclassified() {
        let err = into_script_error(RunnerError::WebDriver {
            error: "javascript error".into(),
            message: "boom".into(),
        });
        assert!(matches!(err, RunnerError::Script(ref m) if m == "boom"));

        let err = into_script_error(RunnerError::WebDriver {
            error: "script timeout".into(),
            message: String::new(),
        });
        assert!(err.is_session_fatal());
    }

    #[test]
    fn test_screenshot_decoding() {
        let png = decode_png(json!(STANDARD.encode(b"\x89PNG"))).unwrap();
        assert_eq!(png, b"\x89PNG");
        assert!(decode_png(json!(42)).is_err());
    }
}
