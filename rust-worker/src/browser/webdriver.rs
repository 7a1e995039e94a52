//! W3C WebDriver client.
//!
//! Talks to chromedriver/geckodriver/Selenium over HTTP with reqwest and
//! classifies WebDriver error codes into transient, session-fatal and fatal
//! failures.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::{ActionError, ActionResult, Browser, Cookie, FailureKind, SessionHandle};
use crate::util::user_agent::{browser_args, pick_user_agent};
use crate::workflow::Action;

/// Web element identifier key defined by the W3C spec.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

#[derive(Debug, Clone)]
pub struct WebDriverSettings {
    /// e.g. `http://localhost:4444`
    pub endpoint: String,
    pub headless: bool,
    pub user_agent_pool: Option<Vec<String>>,
    /// Per HTTP command.
    pub request_timeout: Duration,
    /// Default `wait_for` budget when the action does not carry one.
    pub wait_timeout: Duration,
    pub wait_poll_interval: Duration,
}

impl Default for WebDriverSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4444".to_string(),
            headless: true,
            user_agent_pool: None,
            request_timeout: Duration::from_secs(30),
            wait_timeout: Duration::from_secs(10),
            wait_poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
struct WireError {
    error: String,
    #[serde(default)]
    message: String,
}

/// Unwrap a WebDriver reply. A body that is not JSON comes from something in
/// front of the driver (a grid proxy, a load balancer); on 5xx it is retried.
fn decode_response(status: StatusCode, body: &[u8]) -> Result<Value, ActionError> {
    let wire: WireResponse = match serde_json::from_slice(body) {
        Ok(wire) => wire,
        Err(e) if status.is_server_error() => {
            return Err(ActionError::transient(format!("webdriver endpoint returned {status}: {e}")));
        }
        Err(e) => {
            return Err(ActionError::fatal(format!("invalid webdriver response ({status}): {e}")));
        }
    };

    if status.is_success() {
        return Ok(wire.value);
    }

    let error = serde_json::from_value::<WireError>(wire.value).unwrap_or(WireError {
        error: "unknown error".to_string(),
        message: status.to_string(),
    });
    Err(classify(&error.error, error.message))
}

pub struct WebDriverBrowser {
    client: Client,
    settings: WebDriverSettings,
}

impl WebDriverBrowser {
    pub fn new(settings: WebDriverSettings) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(16)
            .build()
            .context("Failed to create WebDriver HTTP client")?;
        Ok(Self { client, settings })
    }

    fn capabilities(&self) -> Value {
        let user_agent = pick_user_agent(self.settings.user_agent_pool.as_deref());
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "pageLoadStrategy": "normal",
                    "goog:chromeOptions": {
                        "args": browser_args(&user_agent, self.settings.headless),
                        "excludeSwitches": ["enable-automation"],
                    },
                }
            }
        })
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, ActionError> {
        let url = format!("{}{}", self.settings.endpoint.trim_end_matches('/'), path);
        let mut request = self
            .client
            .request(method, &url)
            .timeout(self.settings.request_timeout);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport_error)?;
        decode_response(status, &body)
    }

    async fn find_element(&self, session: &SessionHandle, selector: &str) -> Result<String, ActionError> {
        let value = self
            .command(
                Method::POST,
                &format!("/session/{}/element", session.id()),
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await?;

        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ActionError::fatal(format!("malformed element reference for {selector:?}")))
    }

    /// Run a DevTools command through chromedriver's `goog/cdp` extension.
    async fn cdp(&self, session: &SessionHandle, cmd: &str, params: Value) -> Result<Value, ActionError> {
        self.command(
            Method::POST,
            &format!("/session/{}/goog/cdp/execute", session.id()),
            Some(json!({ "cmd": cmd, "params": params })),
        )
        .await
    }

    async fn wait_for(
        &self,
        session: &SessionHandle,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), ActionError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.find_element(session, selector).await {
                Ok(_) => return Ok(()),
                Err(e) if e.kind == FailureKind::Transient && Instant::now() < deadline => {
                    sleep(self.settings.wait_poll_interval).await;
                }
                Err(e) if e.kind == FailureKind::Transient => {
                    return Err(ActionError::transient(format!(
                        "timed out after {}ms waiting for {selector:?}: {}",
                        timeout.as_millis(),
                        e.message
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn new_session(&self) -> Result<SessionHandle, ActionError> {
        let value = self
            .command(Method::POST, "/session", Some(self.capabilities()))
            .await?;

        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::fatal("webdriver returned no sessionId"))?;

        info!(session_id = id, "webdriver_session_created");
        Ok(SessionHandle::new(id))
    }

    async fn close_session(&self, handle: &SessionHandle) -> Result<(), ActionError> {
        self.command(Method::DELETE, &format!("/session/{}", handle.id()), None)
            .await?;
        debug!(session_id = %handle, "webdriver_session_closed");
        Ok(())
    }

    async fn run_action(&self, handle: &SessionHandle, action: &Action) -> Result<ActionResult, ActionError> {
        let session = handle.id();
        match action {
            Action::Navigate { url } => {
                self.command(
                    Method::POST,
                    &format!("/session/{session}/url"),
                    Some(json!({ "url": url })),
                )
                .await?;
                Ok(ActionResult::done())
            }
            Action::Click { selector } => {
                let element = self.find_element(handle, selector).await?;
                self.command(
                    Method::POST,
                    &format!("/session/{session}/element/{element}/click"),
                    Some(json!({})),
                )
                .await?;
                Ok(ActionResult::done())
            }
            Action::Fill { selector, value } => {
                let element = self.find_element(handle, selector).await?;
                self.command(
                    Method::POST,
                    &format!("/session/{session}/element/{element}/clear"),
                    Some(json!({})),
                )
                .await?;
                self.command(
                    Method::POST,
                    &format!("/session/{session}/element/{element}/value"),
                    Some(json!({ "text": value })),
                )
                .await?;
                Ok(ActionResult::done())
            }
            Action::WaitFor { selector, timeout_ms } => {
                let timeout = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.settings.wait_timeout);
                self.wait_for(handle, selector, timeout).await?;
                Ok(ActionResult::done())
            }
            Action::Extract {
                selector,
                attribute,
                ..
            } => {
                let element = self.find_element(handle, selector).await?;
                let path = match attribute {
                    Some(name) => format!("/session/{session}/element/{element}/attribute/{name}"),
                    None => format!("/session/{session}/element/{element}/text"),
                };
                let value = self.command(Method::GET, &path, None).await?;
                Ok(ActionResult {
                    value: value.as_str().map(str::to_string),
                })
            }
        }
    }

    async fn export_cookies(&self, handle: &SessionHandle) -> Result<Vec<Cookie>, ActionError> {
        let value = self.cdp(handle, "Network.getAllCookies", json!({})).await?;
        parse_cookies(value)
    }

    async fn import_cookies(&self, handle: &SessionHandle, cookies: &[Cookie]) -> Result<(), ActionError> {
        if cookies.is_empty() {
            return Ok(());
        }
        let cookies: Vec<Cookie> = cookies.iter().map(restorable).collect();
        self.cdp(handle, "Network.setCookies", json!({ "cookies": cookies }))
            .await?;
        Ok(())
    }
}

fn parse_cookies(mut value: Value) -> Result<Vec<Cookie>, ActionError> {
    let cookies = value.get_mut("cookies").map(Value::take).unwrap_or(Value::Null);
    if cookies.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(cookies).map_err(|e| ActionError::fatal(format!("malformed cookie list: {e}")))
}

/// `Network.setCookies` wants no expiry at all for a session cookie.
fn restorable(cookie: &Cookie) -> Cookie {
    Cookie {
        expires: cookie.expires.filter(|expires| *expires > 0.0),
        ..cookie.clone()
    }
}

fn transport_error(e: reqwest::Error) -> ActionError {
    if e.is_decode() {
        return ActionError::fatal(format!("webdriver decode error: {e}"));
    }
    if e.is_timeout() {
        warn!(error = %e, "webdriver_request_timeout");
    }
    ActionError::transient(format!("webdriver transport error: {e}"))
}

/// Map a W3C WebDriver error code to a failure kind.
pub fn classify(code: &str, message: String) -> ActionError {
    let kind = match code {
        "timeout"
        | "script timeout"
        | "no such element"
        | "stale element reference"
        | "element not interactable"
        | "element click intercepted"
        | "unexpected alert open" => FailureKind::Transient,
        "invalid session id" | "session not created" | "no such window" | "no such frame" => {
            FailureKind::SessionFatal
        }
        _ => FailureKind::Fatal,
    };
    ActionError {
        kind,
        message: format!("{code}: {message}"),
    }
}
