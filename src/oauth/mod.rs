//! OAuth 2.0 client for downstream MCP servers
//!
//! Implements the authorization code flow with PKCE (RFC 7636) for
//! downstream servers that require a bearer token.
//!
//! Features:
//! - File-backed token and client registration cache
//! - Loopback callback server for auth code reception
//! - Metadata discovery (RFC 9728, RFC 8414) driven by a preflight 401
//! - Dynamic client registration (RFC 7591)
//! - Browser-based authorization

mod callback;
mod client;
mod flow;
mod metadata;
mod storage;

pub use callback::{CALLBACK_PATH, CallbackParams, CallbackReceiver, CallbackResult};
pub use client::OAuthClient;
pub use flow::{
    AuthorizationFlow, AuthorizationHandler, AuthorizationProvider, ClientMetadata,
    HandshakeContext, UrlOpener, ensure_token, request_headers,
};
pub use metadata::{AuthorizationServerMetadata, BearerChallenge, ProtectedResourceMetadata};
pub use storage::{ClientRegistration, Credential, TokenStore};
