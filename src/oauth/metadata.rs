//! OAuth Metadata Discovery
//!
//! Implements RFC 8414 (OAuth Authorization Server Metadata), RFC 9728
//! (OAuth Protected Resource Metadata) and parsing of the Bearer
//! `WWW-Authenticate` challenge that points at them.

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;
use url::Url;

use crate::{Error, Result};

/// OAuth Authorization Server Metadata (RFC 8414)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL
    #[serde(default)]
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Dynamic client registration endpoint (optional)
    #[serde(default)]
    pub registration_endpoint: Option<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// OAuth Protected Resource Metadata (RFC 9728)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Protected resource identifier
    pub resource: String,

    /// Authorization servers that can issue tokens for this resource
    #[serde(default)]
    pub authorization_servers: Vec<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,
}

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BearerChallenge {
    /// `resource_metadata` URL (RFC 9728 section 5.1)
    pub resource_metadata: Option<String>,

    /// Scope the resource asks for
    pub scope: Option<String>,

    /// Error code, e.g. `invalid_token`
    pub error: Option<String>,
}

/// Deserialize scopes that may be either a string or array
/// Some implementations incorrectly return `"read write"` instead of `["read", "write"]`
fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(s) => Ok(s.split_whitespace().map(String::from).collect()),
        StringOrVec::Vec(v) => Ok(v),
    }
}

impl BearerChallenge {
    /// Parse a `WWW-Authenticate` header value. Returns `None` when the
    /// header carries no Bearer challenge.
    pub fn parse(header: &str) -> Option<Self> {
        let trimmed = header.trim_start();
        let scheme_end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        if !trimmed[..scheme_end].eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut challenge = Self::default();
        for (key, value) in auth_params(&trimmed[scheme_end..]) {
            match key.to_ascii_lowercase().as_str() {
                "resource_metadata" => challenge.resource_metadata = Some(value),
                "scope" => challenge.scope = Some(value),
                "error" => challenge.error = Some(value),
                _ => {}
            }
        }
        Some(challenge)
    }
}

/// Split `k1="v1", k2=v2` auth-params, honouring quoted strings
fn auth_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }

        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        let key = key.trim().to_string();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
            value = value.trim().to_string();
        }

        params.push((key, value));
    }

    params
}

impl AuthorizationServerMetadata {
    /// Discover authorization server metadata for an issuer URL.
    ///
    /// Tries the RFC 8414 well-known path, then OpenID Connect discovery.
    /// For issuers with a path component the path is inserted after the
    /// well-known prefix as RFC 8414 section 3.1 describes.
    ///
    /// # Errors
    ///
    /// Returns an error if no metadata document could be fetched.
    pub async fn discover(client: &Client, issuer: &str) -> Result<Self> {
        let mut last_error = None;
        for url in well_known_urls(issuer, &["oauth-authorization-server", "openid-configuration"])? {
            debug!(url = %url, "Discovering OAuth authorization server metadata");
            match fetch_json::<Self>(client, &url).await {
                Ok(metadata) => {
                    debug!(issuer = %metadata.issuer, "Discovered authorization server");
                    return Ok(metadata);
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "Authorization server metadata not found");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::OAuth(format!("No authorization server metadata for {issuer}"))
        }))
    }

    /// Conventional endpoints used when a server publishes no metadata
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not a valid URL.
    pub fn fallback(base_url: &str) -> Result<Self> {
        let base = self::base_url(base_url)?;
        Ok(Self {
            issuer: base.clone(),
            authorization_endpoint: format!("{base}/authorize"),
            token_endpoint: format!("{base}/token"),
            registration_endpoint: Some(format!("{base}/register")),
            scopes_supported: Vec::new(),
            code_challenge_methods_supported: vec!["S256".to_string()],
        })
    }

    /// Check if PKCE is supported (S256 method)
    #[must_use]
    pub fn supports_pkce(&self) -> bool {
        self.code_challenge_methods_supported
            .iter()
            .any(|m| m == "S256")
    }
}

impl ProtectedResourceMetadata {
    /// Fetch protected resource metadata from an explicit URL, as advertised
    /// in a `resource_metadata` challenge parameter
    ///
    /// # Errors
    ///
    /// Returns an error if the document is unreachable or invalid.
    pub async fn fetch(client: &Client, url: &str) -> Result<Self> {
        debug!(url = %url, "Fetching OAuth protected resource metadata");
        let metadata: Self = fetch_json(client, url).await?;
        debug!(resource = %metadata.resource, "Discovered protected resource");
        Ok(metadata)
    }

    /// Discover protected resource metadata for a resource URL via the
    /// well-known path
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata endpoint is unreachable or returns invalid data.
    pub async fn discover(client: &Client, resource_url: &str) -> Result<Self> {
        let mut last_error = None;
        for url in well_known_urls(resource_url, &["oauth-protected-resource"])? {
            match Self::fetch(client, &url).await {
                Ok(metadata) => return Ok(metadata),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::OAuth(format!("No protected resource metadata for {resource_url}"))
        }))
    }

    /// Get the first authorization server URL
    pub fn authorization_server(&self) -> Option<&str> {
        self.authorization_servers.first().map(String::as_str)
    }
}

async fn fetch_json<T: serde::de::DeserializeOwned>(client: &Client, url: &str) -> Result<T> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::OAuth(format!("Failed to fetch {url}: {e}")))?;

    if !response.status().is_success() {
        return Err(Error::OAuth(format!(
            "Metadata request to {url} failed: HTTP {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| Error::OAuth(format!("Failed to parse metadata from {url}: {e}")))
}

/// Candidate well-known URLs for `url`: path-inserted form first (when the
/// URL has a path), then the root form
fn well_known_urls(url: &str, suffixes: &[&str]) -> Result<Vec<String>> {
    let base = base_url(url)?;
    let parsed = Url::parse(url).map_err(|e| Error::OAuth(format!("Invalid URL: {e}")))?;
    let path = parsed.path().trim_end_matches('/');

    let mut urls = Vec::new();
    for suffix in suffixes {
        if !path.is_empty() {
            urls.push(format!("{base}/.well-known/{suffix}{path}"));
        }
        urls.push(format!("{base}/.well-known/{suffix}"));
    }
    Ok(urls)
}

/// Extract the base URL (scheme + host + port) from a full URL
pub fn base_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| Error::OAuth(format!("Invalid URL: {e}")))?;

    let mut base = format!(
        "{}://{}",
        parsed.scheme(),
        parsed.host_str().unwrap_or("localhost")
    );

    if let Some(port) = parsed.port() {
        use std::fmt::Write;
        let _ = write!(base, ":{port}");
    }

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // WWW-Authenticate parsing
    // =========================================================================

    #[test]
    fn parses_bearer_challenge_with_resource_metadata() {
        let header = r#"Bearer error="invalid_token", resource_metadata="https://mcp.example.com/.well-known/oauth-protected-resource", scope="read write""#;
        let challenge = BearerChallenge::parse(header).unwrap();
        assert_eq!(
            challenge.resource_metadata.as_deref(),
            Some("https://mcp.example.com/.well-known/oauth-protected-resource")
        );
        assert_eq!(challenge.scope.as_deref(), Some("read write"));
        assert_eq!(challenge.error.as_deref(), Some("invalid_token"));
    }

    #[test]
    fn parses_unquoted_params_and_case_insensitive_scheme() {
        let challenge = BearerChallenge::parse("bearer error=invalid_request ,scope=tasks").unwrap();
        assert_eq!(challenge.error.as_deref(), Some("invalid_request"));
        assert_eq!(challenge.scope.as_deref(), Some("tasks"));
        assert!(challenge.resource_metadata.is_none());
    }

    #[test]
    fn bare_bearer_challenge_has_no_params() {
        assert_eq!(BearerChallenge::parse("Bearer"), Some(BearerChallenge::default()));
    }

    #[test]
    fn quoted_values_may_contain_commas_and_escapes() {
        let challenge = BearerChallenge::parse(r#"Bearer scope="a,b \"c\"""#).unwrap();
        assert_eq!(challenge.scope.as_deref(), Some(r#"a,b "c""#));
    }

    #[test]
    fn non_bearer_scheme_is_ignored() {
        assert!(BearerChallenge::parse(r#"Basic realm="x""#).is_none());
    }

    // =========================================================================
    // deserialize_scopes
    // =========================================================================

    #[test]
    fn test_deserialize_scopes_array() {
        let json = r#"{"resource": "http://localhost", "scopes_supported": ["read", "write"]}"#;
        let meta: ProtectedResourceMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.scopes_supported, vec!["read", "write"]);
    }

    #[test]
    fn test_deserialize_scopes_string() {
        let json = r#"{"resource": "http://localhost", "scopes_supported": "read write"}"#;
        let meta: ProtectedResourceMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.scopes_supported, vec!["read", "write"]);
    }

    #[test]
    fn deserialize_scopes_missing_field() {
        let json = r#"{"resource": "http://localhost"}"#;
        let meta: ProtectedResourceMetadata = serde_json::from_str(json).unwrap();
        assert!(meta.scopes_supported.is_empty());
        assert_eq!(meta.authorization_server(), None);
    }

    // =========================================================================
    // URL helpers
    // =========================================================================

    #[test]
    fn test_base_url_extraction() {
        assert_eq!(
            base_url("http://localhost:8080/api/v1").unwrap(),
            "http://localhost:8080"
        );
        assert_eq!(
            base_url("https://example.com/path?foo=bar").unwrap(),
            "https://example.com"
        );
        assert!(base_url("not a valid url").is_err());
    }

    #[test]
    fn well_known_urls_insert_path_first() {
        let urls = well_known_urls("https://auth.example.com/tenant1", &["oauth-authorization-server"]).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://auth.example.com/.well-known/oauth-authorization-server/tenant1",
                "https://auth.example.com/.well-known/oauth-authorization-server",
            ]
        );
    }

    #[test]
    fn well_known_urls_for_root_issuer() {
        let urls = well_known_urls("https://auth.example.com/", &["a", "b"]).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://auth.example.com/.well-known/a",
                "https://auth.example.com/.well-known/b",
            ]
        );
    }

    // =========================================================================
    // AuthorizationServerMetadata
    // =========================================================================

    #[test]
    fn deserialize_auth_server_metadata_full() {
        let json = r#"{
            "issuer": "https://auth.example.com",
            "authorization_endpoint": "https://auth.example.com/authorize",
            "token_endpoint": "https://auth.example.com/token",
            "registration_endpoint": "https://auth.example.com/register",
            "scopes_supported": "read write admin",
            "code_challenge_methods_supported": ["S256"]
        }"#;
        let meta: AuthorizationServerMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.registration_endpoint.as_deref(), Some("https://auth.example.com/register"));
        assert!(meta.supports_pkce());
        assert_eq!(meta.scopes_supported, vec!["read", "write", "admin"]);
    }

    #[test]
    fn deserialize_auth_server_metadata_minimal() {
        let json = r#"{
            "authorization_endpoint": "https://auth.example.com/authorize",
            "token_endpoint": "https://auth.example.com/token"
        }"#;
        let meta: AuthorizationServerMetadata = serde_json::from_str(json).unwrap();
        assert!(meta.registration_endpoint.is_none());
        assert!(!meta.supports_pkce());
    }

    #[test]
    fn fallback_endpoints_hang_off_the_base_url() {
        let meta = AuthorizationServerMetadata::fallback("https://mcp.example.com/v1/mcp").unwrap();
        assert_eq!(meta.authorization_endpoint, "https://mcp.example.com/authorize");
        assert_eq!(meta.token_endpoint, "https://mcp.example.com/token");
        assert_eq!(meta.registration_endpoint.as_deref(), Some("https://mcp.example.com/register"));
    }
}
