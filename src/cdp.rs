//! Chrome DevTools Protocol adapter implementation

use crate::{EngineConfig, Error, RenderRequest, Result, Screenshotter, Viewport};
use async_trait::async_trait;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::types::Method;
use headless_chrome::protocol::cdp::{Emulation, Page, Target};
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How often `document.readyState` is sampled while waiting for the DOM
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Evaluation errors Chrome reports while one document replaces another
const DOCUMENT_SWAP_ERRORS: [&str; 3] = [
    "Cannot find context with specified id",
    "Execution context was destroyed",
    "Cannot find default execution context",
];

/// `Target.getBrowserContexts`, with the id list typed as a list
#[derive(Debug, Serialize)]
struct ListBrowserContexts {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrowserContextList {
    browser_context_ids: Vec<String>,
}

impl Method for ListBrowserContexts {
    const NAME: &'static str = "Target.getBrowserContexts";
    type ReturnObject = BrowserContextList;
}

/// CDP-based screenshot engine (uses the `headless_chrome` crate)
///
/// One headless Chrome process is launched up front and shared by every
/// capture. Each capture runs in its own browser context so concurrent
/// renders never see each other's cookies, storage or viewport.
pub struct CdpEngine {
    browser: Browser,
    /// Page in the default context used for browser-level commands
    control: Arc<Tab>,
    config: EngineConfig,
}

impl CdpEngine {
    /// Launch headless Chrome. Blocks until the browser is reachable.
    pub fn launch(config: EngineConfig) -> Result<Self> {
        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(config.sandbox)
            .window_size(Some((config.window.width, config.window.height)))
            .idle_browser_timeout(config.idle_timeout)
            .path(config.chrome_path.clone())
            .build()
            .map_err(|e| Error::InitializationError(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::InitializationError(format!("Failed to launch browser: {}", e)))?;

        let version = browser
            .get_version()
            .map_err(|e| Error::InitializationError(format!("Browser did not answer: {}", e)))?;
        info!("launched {} ({})", version.product, version.protocol_version);

        let control = browser
            .new_tab()
            .map_err(|e| Error::InitializationError(format!("Failed to create control tab: {}", e)))?;

        Ok(Self { browser, control, config })
    }

    /// Number of browser contexts besides the default one
    pub fn live_contexts(&self) -> Result<usize> {
        let contexts = self
            .control
            .call_method(ListBrowserContexts {})
            .map_err(|e| Error::Other(format!("Failed to list browser contexts: {}", e)))?;
        Ok(contexts.browser_context_ids.len())
    }

    /// Number of pages the browser currently has open, the control page included
    pub fn live_pages(&self) -> Result<usize> {
        let tabs = self
            .browser
            .get_tabs()
            .lock()
            .map_err(|e| Error::Other(format!("Tab list poisoned: {}", e)))?;
        Ok(tabs.len())
    }

    /// Create an isolated context holding one page sized to `viewport`.
    async fn open(&self, viewport: Viewport, cancel: &CancellationToken) -> Result<PageLease> {
        let browser = self.browser.clone();
        let control = Arc::clone(&self.control);
        run_blocking(cancel, move || {
            let context = browser
                .new_context()
                .map_err(|e| Error::ContextError(e.to_string()))?;

            // From here on every early return disposes the context.
            let mut lease = ContextLease {
                control,
                id: context.get_id().to_string(),
                page: None,
            };
            let tab = context
                .new_tab()
                .map_err(|e| Error::PageError(e.to_string()))?;
            lease.page = Some(Arc::clone(&tab));

            tab.call_method(Emulation::SetDeviceMetricsOverride {
                width: viewport.width,
                height: viewport.height,
                device_scale_factor: 1.0,
                mobile: false,
                scale: None,
                screen_width: None,
                screen_height: None,
                position_x: None,
                position_y: None,
                dont_set_visible_size: None,
                screen_orientation: None,
                viewport: None,
                display_feature: None,
                device_posture: None,
            })
            .map_err(|e| Error::PageError(format!("sizing viewport: {}", e)))?;

            Ok(PageLease { tab, _context: lease })
        })
        .await
    }

    /// Close the browser and terminate the Chrome process
    pub fn close(self) -> Result<()> {
        // Dropping the last handle kills the child process.
        drop(self.control);
        drop(self.browser);
        Ok(())
    }
}

#[async_trait]
impl Screenshotter for CdpEngine {
    async fn capture(&self, request: &RenderRequest, cancel: &CancellationToken) -> Result<Vec<u8>> {
        ensure_live(cancel)?;
        let page = self.open(request.viewport, cancel).await?;
        ensure_live(cancel)?;

        page.navigate(&request.url, self.config.navigation_timeout, cancel)
            .await?;
        pause(request.delay, cancel).await?;
        ensure_live(cancel)?;

        page.screenshot(cancel).await
    }
}

/// A browser context created for one capture, disposed when dropped
struct ContextLease {
    control: Arc<Tab>,
    id: String,
    page: Option<Arc<Tab>>,
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        let control = Arc::clone(&self.control);
        let page = self.page.take();
        let browser_context_id = std::mem::take(&mut self.id);
        let release = move || {
            if let Some(page) = page {
                if let Err(e) = page.close(false) {
                    debug!("closing page in context {}: {}", browser_context_id, e);
                }
            }
            if let Err(e) = control.call_method(Target::DisposeBrowserContext {
                browser_context_id: browser_context_id.clone(),
            }) {
                warn!("disposing browser context {}: {}", browser_context_id, e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(release);
            }
            Err(_) => release(),
        }
    }
}

/// The page of a capture; dropping it releases the page and its context
struct PageLease {
    tab: Arc<Tab>,
    _context: ContextLease,
}

impl PageLease {
    /// Navigate once and wait until the DOM has been parsed.
    async fn navigate(&self, url: &str, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + timeout;

        let tab = Arc::clone(&self.tab);
        let target = url.to_string();
        run_blocking(cancel, move || {
            tab.set_default_timeout(timeout);
            tab.navigate_to(&target)
                .map(|_| ())
                .map_err(|e| Error::NavigationError {
                    url: target.clone(),
                    reason: e.to_string(),
                })
        })
        .await?;

        loop {
            let tab = Arc::clone(&self.tab);
            let target = url.to_string();
            let state = run_blocking(cancel, move || match tab.evaluate("document.readyState", false) {
                Ok(object) => Ok(object.value.and_then(|value| value.as_str().map(str::to_owned))),
                Err(e) if is_document_swap(&e.to_string()) => Ok(None),
                Err(e) => Err(Error::NavigationError {
                    url: target,
                    reason: format!("reading readyState: {}", e),
                }),
            })
            .await?;

            if matches!(state.as_deref(), Some("interactive" | "complete")) {
                debug!("{} reached readyState {:?}", url, state);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::NavigationError {
                    url: url.to_string(),
                    reason: format!("timed out after {}ms waiting for DOMContentLoaded", timeout.as_millis()),
                });
            }
            pause(READY_POLL_INTERVAL, cancel).await?;
        }
    }

    async fn screenshot(&self, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let tab = Arc::clone(&self.tab);
        run_blocking(cancel, move || {
            tab.capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(|e| Error::CaptureError(e.to_string()))
        })
        .await
    }
}

/// Whether an evaluation error only means the old document is going away
fn is_document_swap(message: &str) -> bool {
    DOCUMENT_SWAP_ERRORS.iter().any(|known| message.contains(known))
}

/// Run a blocking CDP call on the blocking pool, giving up as soon as `cancel` fires.
///
/// A call that is abandoned keeps running in the background; whatever it
/// returns (including a `PageLease`) is dropped and released there.
async fn run_blocking<T, F>(cancel: &CancellationToken, job: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::task::spawn_blocking(job);
    tokio::select! {
        joined = handle => joined.map_err(|e| Error::Other(format!("CDP worker failed: {}", e)))?,
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// Fail with `Error::Cancelled` if the caller already gave up.
pub(crate) fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Sleep for `delay`, returning early with `Error::Cancelled` if `cancel` fires.
pub(crate) async fn pause(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_swap_errors_are_retried() {
        assert!(is_document_swap("Method call error -32000: Cannot find context with specified id"));
        assert!(is_document_swap("Execution context was destroyed, most likely because of a navigation."));
    }

    #[test]
    fn test_other_evaluate_errors_are_fatal() {
        assert!(!is_document_swap("Unable to make method calls because underlying connection is closed"));
        assert!(!is_document_swap("Target closed"));
        assert!(!is_document_swap("The event waited for never came"));
    }

    #[test]
    fn test_ensure_live() {
        let cancel = CancellationToken::new();
        assert!(ensure_live(&cancel).is_ok());
        cancel.cancel();
        assert!(matches!(ensure_live(&cancel), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_pause_zero_is_immediate_even_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(pause(Duration::ZERO, &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_pause_completes() {
        let cancel = CancellationToken::new();
        let started = Instant::now();
        pause(Duration::from_millis(20), &cancel).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_pause_interrupted_by_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let res = pause(Duration::from_secs(10), &cancel).await;
        assert!(matches!(res, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_blocking_returns_job_result() {
        let cancel = CancellationToken::new();
        let value = run_blocking(&cancel, || Ok(7)).await.unwrap();
        assert_eq!(value, 7);

        let err = run_blocking::<(), _>(&cancel, || Err(Error::CaptureError("boom".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CaptureError(_)));
    }

    #[tokio::test]
    async fn test_run_blocking_abandons_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = run_blocking(&cancel, || {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[test]
    fn test_cdp_engine_creation() {
        let config = EngineConfig::default();
        // This test requires Chrome to be installed, so we skip it in CI
        if std::env::var("CI").is_ok() {
            return;
        }
        let result = CdpEngine::launch(config);
        if let Err(e) = result {
            eprintln!("Skipping CDP engine creation test because Chrome is not available or failed to launch: {}", e);
            return;
        }
        assert!(result.unwrap().close().is_ok());
    }
}
