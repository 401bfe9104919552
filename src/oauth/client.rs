//! OAuth Client
//!
//! Default handshake provider: authorization code flow with PKCE against
//! whatever authorization server the downstream MCP server points at.
//!
//! 1. Preflight `POST` to the server URL; a `401` starts the flow
//! 2. Protected resource + authorization server metadata discovery
//! 3. Client registration (configured id, cached registration, or RFC 7591)
//! 4. Authorization URL handed to the redirect handler, result awaited
//! 5. Code exchange at the token endpoint, credential persisted

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use reqwest::{Client, StatusCode, header::WWW_AUTHENTICATE};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use super::flow::{AuthorizationProvider, HandshakeContext};
use super::metadata::{AuthorizationServerMetadata, BearerChallenge, ProtectedResourceMetadata, base_url};
use super::storage::{ClientRegistration, Credential};
use crate::{Error, Result};

/// OAuth client driving the interactive handshake
#[derive(Debug, Clone, Default)]
pub struct OAuthClient {
    /// HTTP client for preflight, discovery and token requests
    http_client: Client,

    /// Pre-registered client id, skips dynamic registration
    client_id: Option<String>,

    /// Requested scopes (empty = whatever the server advertises)
    scopes: Vec<String>,
}

/// OAuth token response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

/// Client registration response
#[derive(Debug, Deserialize)]
struct ClientRegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    redirect_uris: Vec<String>,
    #[serde(default)]
    client_name: Option<String>,
}

/// Everything discovery learned about where and how to authorize
#[derive(Debug)]
struct Discovery {
    auth_metadata: AuthorizationServerMetadata,
    /// RFC 8707 resource indicator
    resource: String,
    scope: Option<String>,
}

/// PKCE verifier and its S256 challenge
#[derive(Debug)]
pub(crate) struct Pkce {
    pub(crate) verifier: String,
    pub(crate) challenge: String,
}

impl OAuthClient {
    /// Create a client using the given HTTP client
    #[must_use]
    pub fn new(http_client: Client) -> Self {
        Self {
            http_client,
            client_id: None,
            scopes: Vec::new(),
        }
    }

    /// Use a pre-registered client id instead of dynamic registration
    #[must_use]
    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    /// Request these scopes instead of the advertised ones
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Send the unauthenticated preflight and return the Bearer challenge
    /// if the server demanded authentication
    async fn preflight(&self, server_url: &str) -> Result<Option<BearerChallenge>> {
        let response = self.http_client.post(server_url).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            warn!(
                url = %server_url,
                status = %response.status(),
                "Preflight was not challenged, no authorization performed"
            );
            return Ok(None);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse)
            .unwrap_or_default();

        debug!(url = %server_url, ?challenge, "Received authentication challenge");
        Ok(Some(challenge))
    }

    async fn discover(&self, server_url: &str, challenge: &BearerChallenge) -> Result<Discovery> {
        let resource_meta = match &challenge.resource_metadata {
            Some(url) => ProtectedResourceMetadata::fetch(&self.http_client, url).await,
            None => ProtectedResourceMetadata::discover(&self.http_client, server_url).await,
        };
        let resource_meta = match resource_meta {
            Ok(meta) => Some(meta),
            Err(e) => {
                debug!(error = %e, "No protected resource metadata, using server base URL");
                None
            }
        };

        let issuer = match resource_meta.as_ref().and_then(ProtectedResourceMetadata::authorization_server) {
            Some(issuer) => issuer.to_string(),
            None => base_url(server_url)?,
        };

        let auth_metadata = match AuthorizationServerMetadata::discover(&self.http_client, &issuer).await {
            Ok(meta) => meta,
            Err(e) => {
                debug!(issuer = %issuer, error = %e, "No authorization server metadata, using default endpoints");
                AuthorizationServerMetadata::fallback(&issuer)?
            }
        };
        if !auth_metadata.supports_pkce() {
            debug!(issuer = %issuer, "Server does not advertise S256 PKCE, sending it anyway");
        }

        let scope = if !self.scopes.is_empty() {
            Some(self.scopes.join(" "))
        } else if let Some(scope) = &challenge.scope {
            Some(scope.clone())
        } else {
            resource_meta
                .as_ref()
                .filter(|meta| !meta.scopes_supported.is_empty())
                .map(|meta| meta.scopes_supported.join(" "))
        };

        let resource = resource_meta.map_or_else(|| server_url.to_string(), |meta| meta.resource);

        Ok(Discovery {
            auth_metadata,
            resource,
            scope,
        })
    }

    /// Pick the client identity for this handshake
    async fn client_registration(
        &self,
        ctx: &HandshakeContext<'_>,
        auth_metadata: &AuthorizationServerMetadata,
        redirect_uri: &str,
    ) -> Result<ClientRegistration> {
        if let Some(client_id) = &self.client_id {
            return Ok(ClientRegistration {
                client_id: client_id.clone(),
                client_secret: None,
                redirect_uris: ctx.client_metadata.redirect_uris.clone(),
                client_name: Some(ctx.client_metadata.client_name.clone()),
            });
        }

        if let Some(info) = ctx.store.get_client_info(ctx.server_name) {
            if info.accepts_redirect(redirect_uri) {
                debug!(server = %ctx.server_name, client_id = %info.client_id, "Reusing cached client registration");
                return Ok(info);
            }
            debug!(server = %ctx.server_name, "Cached client registration has a stale redirect URI");
        }

        let Some(endpoint) = &auth_metadata.registration_endpoint else {
            return Err(Error::OAuth(format!(
                "Authorization server for {} does not support dynamic client registration and no client_id is configured",
                ctx.server_name
            )));
        };

        let info = self.register_client(ctx, endpoint).await?;
        ctx.store.set_client_info(ctx.server_name, &info)?;
        Ok(info)
    }

    /// Register a new client dynamically (RFC 7591)
    async fn register_client(&self, ctx: &HandshakeContext<'_>, endpoint: &str) -> Result<ClientRegistration> {
        let response = self
            .http_client
            .post(endpoint)
            .json(ctx.client_metadata)
            .send()
            .await
            .map_err(|e| Error::OAuth(format!("Client registration failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::OAuth(format!(
                "Client registration failed: HTTP {status} - {body}"
            )));
        }

        let reg: ClientRegistrationResponse = response
            .json()
            .await
            .map_err(|e| Error::OAuth(format!("Failed to parse registration response: {e}")))?;

        info!(server = %ctx.server_name, client_id = %reg.client_id, "Registered OAuth client");

        let redirect_uris = if reg.redirect_uris.is_empty() {
            ctx.client_metadata.redirect_uris.clone()
        } else {
            reg.redirect_uris
        };

        Ok(ClientRegistration {
            client_id: reg.client_id,
            client_secret: reg.client_secret,
            redirect_uris,
            client_name: reg.client_name,
        })
    }

    /// Exchange authorization code for tokens
    async fn exchange_code(
        &self,
        token_endpoint: &str,
        client: &ClientRegistration,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
        resource: &str,
    ) -> Result<Credential> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client.client_id.as_str()),
            ("code_verifier", code_verifier),
            ("resource", resource),
        ];
        if let Some(secret) = &client.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        let response = self
            .http_client
            .post(token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::OAuth(format!("Token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::OAuth(format!(
                "Token exchange failed: HTTP {status} - {body}"
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::OAuth(format!("Failed to parse token response: {e}")))?;

        Ok(Credential::from_response(
            token_response.access_token,
            token_response.token_type,
            token_response.refresh_token,
            token_response.expires_in,
            token_response.scope,
        ))
    }
}

#[async_trait]
impl AuthorizationProvider for OAuthClient {
    async fn authorize(&self, ctx: &HandshakeContext<'_>) -> Result<()> {
        let Some(challenge) = self.preflight(ctx.server_url).await? else {
            return Ok(());
        };

        let redirect_uri = ctx
            .client_metadata
            .redirect_uris
            .first()
            .ok_or_else(|| Error::Internal("Client metadata has no redirect URI".to_string()))?;

        let discovery = self.discover(ctx.server_url, &challenge).await?;
        let client = self
            .client_registration(ctx, &discovery.auth_metadata, redirect_uri)
            .await?;

        let pkce = Pkce::generate();
        let state = generate_state();
        let auth_url = authorization_url(
            &discovery.auth_metadata.authorization_endpoint,
            &client.client_id,
            redirect_uri,
            &state,
            &pkce.challenge,
            discovery.scope.as_deref(),
            &discovery.resource,
        )?;

        ctx.handler.present_authorization_url(auth_url.as_str()).await?;
        let callback = ctx.handler.await_authorization_result().await?;

        if callback.state.as_deref() != Some(state.as_str()) {
            return Err(Error::OAuth(
                "State mismatch in authorization callback - possible CSRF attack".to_string(),
            ));
        }
        debug!(server = %ctx.server_name, "Received authorization code");

        let token = self
            .exchange_code(
                &discovery.auth_metadata.token_endpoint,
                &client,
                &callback.code,
                redirect_uri,
                &pkce.verifier,
                &discovery.resource,
            )
            .await?;

        ctx.store.set_tokens(ctx.server_name, &token)?;
        Ok(())
    }
}

/// Build the authorization request URL
fn authorization_url(
    endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
    code_challenge: &str,
    scope: Option<&str>,
    resource: &str,
) -> Result<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| Error::OAuth(format!("Invalid authorization endpoint: {e}")))?;

    {
        let mut params = url.query_pairs_mut();
        params.append_pair("response_type", "code");
        params.append_pair("client_id", client_id);
        params.append_pair("redirect_uri", redirect_uri);
        params.append_pair("state", state);
        params.append_pair("code_challenge", code_challenge);
        params.append_pair("code_challenge_method", "S256");
        params.append_pair("resource", resource);
        if let Some(scope) = scope {
            params.append_pair("scope", scope);
        }
    }

    Ok(url)
}

impl Pkce {
    /// Generate PKCE code verifier and challenge
    pub(crate) fn generate() -> Self {
        let verifier = URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>());
        let challenge = s256(&verifier);
        Self { verifier, challenge }
    }
}

/// S256 code challenge for a verifier
pub(crate) fn s256(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest.as_slice())
}

/// Generate a random state parameter
fn generate_state() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 16]>())
}
