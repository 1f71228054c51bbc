//! PageCap
//!
//! An HTTP service that renders a web page in headless Chrome and returns a
//! PNG screenshot of it.
//!
//! # Features
//!
//! - **CDP Backend** (default): drives headless Chrome over the Chrome DevTools Protocol
//! - **Isolated renders**: every request gets its own browser context and page
//! - **Cancellable**: client disconnects, deadlines and shutdown abort in-flight renders
//!
//! # Example
//!
//! ```no_run
//! use pagecap::{EngineConfig, RenderRequest, Screenshotter, Viewport};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = pagecap::cdp::CdpEngine::launch(EngineConfig::default())?;
//! let request = RenderRequest {
//!     url: "https://example.com".to_string(),
//!     viewport: Viewport { width: 1024, height: 768 },
//!     delay: Duration::ZERO,
//! };
//! let png = engine.capture(&request, &CancellationToken::new()).await?;
//! println!("{} bytes", png.len());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub mod error;
pub use error::{Error, Result};

pub mod config;
pub mod handler;
pub mod server;

#[cfg(feature = "cdp")]
pub mod cdp;

/// MIME type of every image produced by a [`Screenshotter`]
pub const PNG_MIME: &str = "image/png";

/// Configuration for the browser engine
///
/// The defaults launch a sandboxed headless Chrome found on the `PATH` and
/// give each navigation 30 seconds to reach the content-loaded milestone.
///
/// # Examples
///
/// ```
/// let cfg = pagecap::EngineConfig::default();
/// assert_eq!(cfg.navigation_timeout.as_secs(), 30);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound for a single navigation, including the wait for the DOM
    pub navigation_timeout: Duration,
    /// How long the browser connection may sit without CDP traffic before
    /// the client considers it dead
    pub idle_timeout: Duration,
    /// Window size used when launching the browser
    pub window: Viewport,
    /// Explicit Chrome/Chromium binary, auto-detected when `None`
    pub chrome_path: Option<PathBuf>,
    /// Whether to keep Chrome's sandbox enabled
    pub sandbox: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(24 * 60 * 60),
            window: Viewport::default(),
            chrome_path: None,
            sandbox: true,
        }
    }
}

/// Viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

/// A single normalized screenshot request
///
/// `url` is already validated as an absolute http(s) URL; backends do not
/// re-check the scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    /// Target URL, exactly as normalized by the handler
    pub url: String,
    /// Viewport of the isolated page
    pub viewport: Viewport,
    /// Pause between the content-loaded milestone and the capture
    pub delay: Duration,
}

/// The single capability the HTTP layer needs from a browser backend
///
/// Implementations must honour `cancel` at every suspension point and must
/// release any per-call browser resources on every exit path.
#[async_trait]
pub trait Screenshotter: Send + Sync {
    /// Render `request` and return the PNG bytes of the viewport
    async fn capture(&self, request: &RenderRequest, cancel: &CancellationToken) -> Result<Vec<u8>>;
}
