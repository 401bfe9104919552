//! Token acquisition flow
//!
//! Returns a bearer token for a downstream server, from the cache when
//! possible and through the interactive browser handshake otherwise.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use super::callback::{CallbackReceiver, CallbackResult};
use super::client::OAuthClient;
use super::storage::TokenStore;
use crate::config::ServerConfig;
use crate::{Error, Result};

/// Opens a URL for the user, normally in the default browser
pub type UrlOpener = Arc<dyn Fn(&str) -> std::io::Result<()> + Send + Sync>;

/// Client metadata sent with dynamic client registration (RFC 7591)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientMetadata {
    /// Human-readable client name
    pub client_name: String,
    /// Redirect URIs, the loopback receiver's first
    pub redirect_uris: Vec<String>,
    /// `none`: public client, no secret exchange
    pub token_endpoint_auth_method: String,
    /// Grant types the client will use
    pub grant_types: Vec<String>,
    /// Response types the client will use
    pub response_types: Vec<String>,
}

impl ClientMetadata {
    /// Metadata for a public loopback client of `server_name`
    #[must_use]
    pub fn for_server(server_name: &str, redirect_uri: String) -> Self {
        Self {
            client_name: format!("agent-mcp ({server_name})"),
            redirect_uris: vec![redirect_uri],
            token_endpoint_auth_method: "none".to_string(),
            grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
            response_types: vec!["code".to_string()],
        }
    }
}

/// The user-facing half of the handshake
#[async_trait]
pub trait AuthorizationHandler: Send + Sync {
    /// Show the authorization URL to the user
    async fn present_authorization_url(&self, url: &str) -> Result<()>;

    /// Wait for the authorization server's redirect
    async fn await_authorization_result(&self) -> Result<CallbackResult>;
}

/// Everything a provider needs for one handshake
pub struct HandshakeContext<'a> {
    /// Downstream server name, also the token store key
    pub server_name: &'a str,
    /// Downstream server URL, target of the preflight
    pub server_url: &'a str,
    /// Registration metadata for this client
    pub client_metadata: &'a ClientMetadata,
    /// Where tokens and client registrations are persisted
    pub store: &'a TokenStore,
    /// Redirect and callback handling
    pub handler: &'a dyn AuthorizationHandler,
}

/// Drives discovery, registration, authorization and code exchange.
///
/// A successful handshake persists the credential through
/// [`HandshakeContext::store`]; the flow reads it back from there.
#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    /// Run the handshake for `ctx.server_name`
    async fn authorize(&self, ctx: &HandshakeContext<'_>) -> Result<()>;
}

/// Opens the browser and waits on the loopback receiver
struct BrowserHandler<'a> {
    receiver: &'a CallbackReceiver,
    opener: &'a UrlOpener,
}

#[async_trait]
impl AuthorizationHandler for BrowserHandler<'_> {
    async fn present_authorization_url(&self, url: &str) -> Result<()> {
        // stdout may carry the MCP protocol; the URL goes to stderr
        eprintln!("\nOpening browser for authentication...\n{url}");
        if let Err(e) = (self.opener)(url) {
            warn!(error = %e, "Failed to open browser automatically");
        }
        Ok(())
    }

    async fn await_authorization_result(&self) -> Result<CallbackResult> {
        self.receiver.await_callback().await
    }
}

/// One lock per token record, shared by every flow in the process
static FLOW_LOCKS: LazyLock<DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>> =
    LazyLock::new(DashMap::new);

/// Handle on a record's flow lock; the map entry goes away with the last handle
struct FlowLock {
    record: PathBuf,
    mutex: Arc<tokio::sync::Mutex<()>>,
}

impl FlowLock {
    fn for_record(record: PathBuf) -> Self {
        let mutex = FLOW_LOCKS
            .entry(record.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone();
        Self { record, mutex }
    }
}

impl Drop for FlowLock {
    fn drop(&mut self) {
        // Only the map and this handle are left
        FLOW_LOCKS.remove_if(&self.record, |_, mutex| Arc::strong_count(mutex) == 2);
    }
}

/// Cache-first bearer token acquisition
pub struct AuthorizationFlow {
    store: TokenStore,
    provider: Arc<dyn AuthorizationProvider>,
    opener: UrlOpener,
}

impl AuthorizationFlow {
    /// Flow over the token directory with the default OAuth client and the
    /// system browser
    pub fn new(token_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: TokenStore::new(token_dir),
            provider: Arc::new(OAuthClient::default()),
            opener: Arc::new(|url: &str| webbrowser::open(url)),
        }
    }

    /// Replace the handshake provider
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn AuthorizationProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Replace the browser launcher
    #[must_use]
    pub fn with_url_opener(mut self, opener: UrlOpener) -> Self {
        self.opener = opener;
        self
    }

    /// Token store backing this flow
    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Return a bearer token for `server_name`, running the browser
    /// handshake against `server_url` on a cache miss.
    ///
    /// Concurrent calls for the same server share one handshake.
    pub async fn ensure_token(&self, server_name: &str, server_url: &str) -> Result<String> {
        let record = self.store.record_path(server_name)?;
        if let Some(token) = self.cached_token(server_name) {
            return Ok(token);
        }

        let lock = FlowLock::for_record(record);
        let _guard = lock.mutex.lock().await;

        // Another flow may have finished while we waited
        if let Some(token) = self.cached_token(server_name) {
            return Ok(token);
        }

        info!(server = %server_name, "No cached token, starting OAuth flow");

        // Dropping the receiver also stops it, covering cancellation
        let receiver = CallbackReceiver::bind()?;
        receiver.start()?;
        let result = self.handshake(server_name, server_url, &receiver).await;
        receiver.stop();
        result?;

        self.store
            .get_tokens(server_name)
            .map(|token| token.access_token)
            .ok_or_else(|| Error::NoTokenStored(server_name.to_string()))
    }

    async fn handshake(&self, server_name: &str, server_url: &str, receiver: &CallbackReceiver) -> Result<()> {
        let client_metadata = ClientMetadata::for_server(server_name, receiver.redirect_uri());
        let handler = BrowserHandler {
            receiver,
            opener: &self.opener,
        };
        let ctx = HandshakeContext {
            server_name,
            server_url,
            client_metadata: &client_metadata,
            store: &self.store,
            handler: &handler,
        };
        self.provider.authorize(&ctx).await
    }

    fn cached_token(&self, server_name: &str) -> Option<String> {
        let token = self.store.get_tokens(server_name)?;
        if token.is_expired() {
            warn!(server = %server_name, "Using expired cached OAuth token; clear the cache to re-authenticate");
        } else {
            info!(server = %server_name, "Using cached OAuth token");
        }
        Some(token.access_token)
    }
}

/// Bearer token for a configured downstream server
pub async fn ensure_token(server: &ServerConfig, token_dir: &Path) -> Result<String> {
    let url = server_url(server)?;
    let provider = OAuthClient::default()
        .with_client_id(server.oauth.client_id.clone())
        .with_scopes(server.oauth.scopes.clone());
    AuthorizationFlow::new(token_dir)
        .with_provider(Arc::new(provider))
        .ensure_token(&server.name, url)
        .await
}

/// Headers for requests to a downstream server: the configured ones, plus
/// `Authorization: Bearer <token>` when the server uses OAuth
pub async fn request_headers(server: &ServerConfig, token_dir: &Path) -> Result<HashMap<String, String>> {
    let mut headers = server.headers.clone();
    if server.uses_oauth() {
        let token = ensure_token(server, token_dir).await?;
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
    }
    Ok(headers)
}

fn server_url(server: &ServerConfig) -> Result<&str> {
    server.url.as_deref().ok_or_else(|| {
        Error::Config(format!("Server '{}' uses OAuth but has no url", server.name))
    })
}
