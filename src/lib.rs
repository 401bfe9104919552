//! agent-mcp
//!
//! Bridges a local MCP server to downstream tool servers. This crate holds
//! the pieces the bridge needs to talk to downstream servers that sit behind
//! OAuth: configuration, a per-server token cache, and the browser-based
//! authorization code flow that fills it.
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> agent_mcp::Result<()> {
//! use agent_mcp::{config::Config, oauth};
//!
//! let config = Config::load(None)?;
//! for server in config.oauth_servers() {
//!     let headers = oauth::request_headers(server, &config.token_dir).await?;
//!     println!("{}: {} header(s)", server.name, headers.len());
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod oauth;

pub use error::{Error, Result};
pub use oauth::ensure_token;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging.
///
/// Output goes to stderr: when the bridge runs as a stdio MCP server,
/// stdout is the protocol channel.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    result.map_err(|e| Error::Internal(format!("Failed to setup tracing: {e}")))
}
