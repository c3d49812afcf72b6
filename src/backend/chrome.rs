use super::error::{BackendError, Result};
use super::{selectors, Backend, Connector};
use async_trait::async_trait;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Quote a Rust string as a JavaScript string literal.
fn js_str(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

const JS_VISIBLE: &str =
    "const visible = (el) => !!el && (el.offsetParent !== null || el.getClientRects().length > 0);";

#[derive(Deserialize)]
struct JsonVersion {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

#[derive(Deserialize)]
struct Flag {
    value: bool,
}

#[derive(Deserialize)]
struct TextProbe {
    text: Option<String>,
}

#[derive(Deserialize)]
struct CountProbe {
    count: usize,
}

/// AI Studio page driven over the Chrome DevTools protocol.
pub struct ChromeBackend {
    page: Page,
    _browser: Browser,
    connected: Arc<AtomicBool>,
    diagnostics_dir: PathBuf,
}

impl ChromeBackend {
    async fn eval<T: DeserializeOwned>(&self, script: String) -> Result<T> {
        if !self.is_connected() {
            return Err(BackendError::Disconnected(
                "browser handler has stopped".to_string(),
            ));
        }
        // Explicit params so the IIFE is evaluated as an expression, by value.
        let params = EvaluateParams::builder()
            .expression(script)
            .return_by_value(true)
            .build()
            .map_err(BackendError::Script)?;
        let result = self.page.evaluate(params).await?;
        result
            .into_value::<T>()
            .map_err(|e| BackendError::Script(e.to_string()))
    }

    async fn flag(&self, body: String) -> Result<bool> {
        let probe: Flag = self.eval(body).await?;
        Ok(probe.value)
    }
}

#[async_trait]
impl Backend for ChromeBackend {
    async fn is_input_interactable(&self) -> Result<bool> {
        self.flag(format!(
            "(() => {{ {JS_VISIBLE} const el = document.querySelector({sel}); \
             return {{ value: visible(el) && !el.disabled && !el.readOnly }}; }})()",
            sel = js_str(selectors::INPUT)
        ))
        .await
    }

    async fn fill_input(&self, text: &str) -> Result<()> {
        let filled = self
            .flag(format!(
                "(() => {{ const el = document.querySelector({sel}); \
                 if (!el) return {{ value: false }}; \
                 el.focus(); el.value = {text}; \
                 el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
                 el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
                 return {{ value: true }}; }})()",
                sel = js_str(selectors::INPUT),
                text = js_str(text)
            ))
            .await?;
        if filled {
            Ok(())
        } else {
            Err(BackendError::ElementMissing(selectors::INPUT.to_string()))
        }
    }

    async fn input_value(&self) -> Result<String> {
        let probe: TextProbe = self
            .eval(format!(
                "(() => {{ const el = document.querySelector({sel}); \
                 return {{ text: el ? el.value : null }}; }})()",
                sel = js_str(selectors::INPUT)
            ))
            .await?;
        probe
            .text
            .ok_or_else(|| BackendError::ElementMissing(selectors::INPUT.to_string()))
    }

    async fn is_submit_enabled(&self) -> Result<bool> {
        self.flag(format!(
            "(() => {{ const el = document.querySelector({sel}); \
             return {{ value: !!el && !el.disabled && el.getAttribute('aria-disabled') !== 'true' }}; }})()",
            sel = js_str(selectors::SUBMIT_BUTTON)
        ))
        .await
    }

    async fn click_submit(&self) -> Result<()> {
        let button = self.page.find_element(selectors::SUBMIT_BUTTON).await?;
        button.scroll_into_view().await?;
        button.click().await?;
        Ok(())
    }

    async fn is_busy(&self) -> Result<bool> {
        self.flag(format!(
            "(() => {{ {JS_VISIBLE} return {{ value: visible(document.querySelector({sel})) }}; }})()",
            sel = js_str(selectors::BUSY_SPINNER)
        ))
        .await
    }

    async fn response_text(&self) -> Result<Option<String>> {
        // A visible <pre> holds the unrendered text when the answer is a code block.
        let probe: TextProbe = self
            .eval(format!(
                "(() => {{ {JS_VISIBLE} \
                 const turns = document.querySelectorAll({container}); \
                 if (!turns.length) return {{ text: null }}; \
                 const last = turns[turns.length - 1]; \
                 const pres = last.querySelectorAll('pre'); \
                 const pre = pres.length ? pres[pres.length - 1] : null; \
                 if (visible(pre)) return {{ text: pre.innerText }}; \
                 const node = last.querySelector({text}); \
                 return {{ text: node ? node.innerText : last.innerText }}; }})()",
                container = js_str(selectors::RESPONSE_CONTAINER),
                text = js_str(selectors::RESPONSE_TEXT)
            ))
            .await?;
        Ok(probe.text)
    }

    async fn response_count(&self) -> Result<usize> {
        let probe: CountProbe = self
            .eval(format!(
                "(() => ({{ count: document.querySelectorAll({sel}).length }}))()",
                sel = js_str(selectors::RESPONSE_CONTAINER)
            ))
            .await?;
        Ok(probe.count)
    }

    async fn page_error(&self) -> Result<Option<String>> {
        let probe: TextProbe = self
            .eval(format!(
                "(() => {{ {JS_VISIBLE} \
                 const toasts = document.querySelectorAll({toast}); \
                 const toast = toasts.length ? toasts[toasts.length - 1] : null; \
                 if (!visible(toast)) return {{ text: null }}; \
                 const msg = toast.querySelector({msg}); \
                 return {{ text: (msg ? msg.textContent : toast.textContent) || '' }}; }})()",
                toast = js_str(selectors::ERROR_TOAST),
                msg = js_str(selectors::ERROR_TOAST_TEXT)
            ))
            .await?;
        Ok(probe.text.map(|t| {
            let t = t.trim();
            if t.is_empty() {
                "Error toast detected without a readable message".to_string()
            } else {
                t.to_string()
            }
        }))
    }

    async fn clear_conversation(&self) -> Result<()> {
        let clicked = self
            .flag(format!(
                "(() => {{ const el = document.querySelector({sel}); \
                 if (!el || el.disabled) return {{ value: false }}; \
                 el.click(); return {{ value: true }}; }})()",
                sel = js_str(selectors::CLEAR_CHAT_BUTTON)
            ))
            .await?;
        if !clicked {
            debug!("Clear chat button missing or disabled, nothing to clear");
            return Ok(());
        }

        let confirm_script = format!(
            "(() => {{ const buttons = Array.from(document.querySelectorAll({sel})); \
             const btn = buttons.find(b => b.textContent.trim().includes({label})); \
             if (!btn) return {{ value: false }}; \
             btn.click(); return {{ value: true }}; }})()",
            sel = js_str(selectors::OVERLAY_BUTTONS),
            label = js_str(selectors::CLEAR_CHAT_CONFIRM_LABEL)
        );
        for _ in 0..10 {
            if self.flag(confirm_script.clone()).await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Err(BackendError::Timeout(format!(
            "'{}' confirmation did not appear",
            selectors::CLEAR_CHAT_CONFIRM_LABEL
        )))
    }

    async fn capture_diagnostic(&self, label: &str) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(&self.diagnostics_dir).await?;
        let base = format!("{}_{}", label, chrono::Utc::now().timestamp_millis());
        let mut written = Vec::new();

        let screenshot_path = self.diagnostics_dir.join(format!("{base}.png"));
        match self
            .page
            .save_screenshot(
                ScreenshotParams::builder().full_page(true).build(),
                &screenshot_path,
            )
            .await
        {
            Ok(_) => written.push(screenshot_path),
            Err(e) => warn!("Failed to save screenshot ({}): {}", label, e),
        }

        let html_path = self.diagnostics_dir.join(format!("{base}.html"));
        match self.page.content().await {
            Ok(html) => {
                tokio::fs::write(&html_path, html).await?;
                written.push(html_path);
            }
            Err(e) => warn!("Failed to save page HTML ({}): {}", label, e),
        }

        Ok(written)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Attaches to an already running Chrome that has the backend page open
/// (or opens it).
pub struct ChromeConnector {
    http_client: Client,
    endpoint: String,
    target_url: String,
    url_pattern: String,
    diagnostics_dir: PathBuf,
}

impl ChromeConnector {
    pub fn new(
        endpoint: String,
        target_url: String,
        url_pattern: String,
        diagnostics_dir: PathBuf,
    ) -> Self {
        Self {
            http_client: Client::new(),
            endpoint,
            target_url,
            url_pattern,
            diagnostics_dir,
        }
    }

    /// Accepts either a `ws://` debugger URL or the `http://host:port` of the
    /// DevTools endpoint, in which case the websocket URL is discovered.
    async fn resolve_ws_url(&self) -> Result<String> {
        let endpoint = Url::parse(&self.endpoint)
            .map_err(|e| BackendError::Disconnected(format!("invalid endpoint: {e}")))?;
        match endpoint.scheme() {
            "ws" | "wss" => Ok(endpoint.to_string()),
            _ => {
                let version_url = endpoint
                    .join("/json/version")
                    .map_err(|e| BackendError::Disconnected(format!("invalid endpoint: {e}")))?;
                let resp = self.http_client.get(version_url).send().await?;
                if !resp.status().is_success() {
                    return Err(BackendError::Disconnected(format!(
                        "/json/version returned {}",
                        resp.status()
                    )));
                }
                let body: JsonVersion = resp.json().await?;
                Ok(body.web_socket_debugger_url)
            }
        }
    }
}

#[async_trait]
impl Connector for ChromeConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn Backend>> {
        let ws_url = self.resolve_ws_url().await?;
        info!("Connecting to browser via {}", ws_url);

        let (browser, mut handler) = Browser::connect(ws_url).await?;
        let connected = Arc::new(AtomicBool::new(true));

        // Run browser handler in background; when it ends the session is gone
        let handler_flag = connected.clone();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {}", e);
                }
            }
            warn!("Browser handler stopped, marking backend disconnected");
            handler_flag.store(false, Ordering::SeqCst);
        });

        let mut page = None;
        for candidate in browser.pages().await? {
            let url = candidate.url().await?.unwrap_or_default();
            if url.contains(&self.url_pattern) {
                info!("Attaching to existing backend page: {}", url);
                page = Some(candidate);
                break;
            }
        }
        let page = match page {
            Some(page) => page,
            None => {
                info!("Opening backend page: {}", self.target_url);
                let page = browser.new_page(self.target_url.as_str()).await?;
                page.wait_for_navigation().await?;
                page
            }
        };

        Ok(Arc::new(ChromeBackend {
            page,
            _browser: browser,
            connected,
            diagnostics_dir: self.diagnostics_dir.clone(),
        }))
    }
}
