//! Error types for the screenshot service

use thiserror::Error;

/// Result type alias for render and server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving or rendering a screenshot
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to launch the browser
    #[error("Engine initialization failed: {0}")]
    InitializationError(String),

    /// Failed to create an isolated browser context
    #[error("creating browser context: {0}")]
    ContextError(String),

    /// Failed to open or size a page inside the context
    #[error("creating page: {0}")]
    PageError(String),

    /// Navigation failed or never reached the content-loaded milestone
    #[error("navigating to {url}: {reason}")]
    NavigationError { url: String, reason: String },

    /// The caller gave up on the render
    #[error("render cancelled")]
    Cancelled,

    /// Failed to capture the page
    #[error("taking screenshot: {0}")]
    CaptureError(String),

    /// The request deadline elapsed
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// The requested URL is not an http(s) URL
    #[error("only http and https URLs are allowed: {0}")]
    InvalidUrl(String),

    /// Listener or socket failure
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error was caused by the caller abandoning the render
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Timeout(_))
    }
}
