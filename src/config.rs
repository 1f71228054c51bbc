//! Command line and environment configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::EngineConfig;

/// Runtime settings for the screenshot server
///
/// Every flag can also be supplied through the environment; `PORT` is the
/// only one most deployments need.
#[derive(Debug, Clone, Parser)]
#[command(name = "pagecap", version, about = "Render web pages to PNG screenshots over HTTP")]
pub struct ServerConfig {
    /// TCP port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "PAGECAP_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Upper bound for a single navigation in milliseconds
    #[arg(long, env = "PAGECAP_NAVIGATION_TIMEOUT_MS", default_value_t = 30_000)]
    pub navigation_timeout_ms: u64,

    /// Upper bound for a whole render request in milliseconds
    #[arg(long, env = "PAGECAP_REQUEST_TIMEOUT_MS", default_value_t = 40_000)]
    pub request_timeout_ms: u64,

    /// How long in-flight requests may keep running after a shutdown signal
    #[arg(long, env = "PAGECAP_SHUTDOWN_GRACE_MS", default_value_t = 5_000)]
    pub shutdown_grace_ms: u64,

    /// Chrome/Chromium binary; auto-detected when omitted
    #[arg(long, env = "CHROME_PATH")]
    pub chrome_path: Option<PathBuf>,

    /// Disable Chrome's sandbox (needed when running as root in containers)
    #[arg(long, env = "PAGECAP_NO_SANDBOX")]
    pub no_sandbox: bool,

    /// Answer render failures with a generic message instead of the error text
    #[arg(long, env = "PAGECAP_REDACT_ERRORS")]
    pub redact_errors: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "PAGECAP_LOG", default_value = "info")]
    pub log_level: String,
}

impl ServerConfig {
    /// Socket address the listener binds to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Browser settings derived from the server flags
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            navigation_timeout: Duration::from_millis(self.navigation_timeout_ms),
            chrome_path: self.chrome_path.clone(),
            sandbox: !self.no_sandbox,
            ..EngineConfig::default()
        }
    }
}
