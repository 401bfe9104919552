//! OAuth Callback Server
//!
//! A minimal loopback HTTP server that receives the authorization redirect
//! after the user approves access in the browser.
//!
//! The socket is bound on construction so the redirect URI is known before
//! client registration. Serving happens on a dedicated thread with its own
//! single-threaded runtime; the first `code` or `error` is handed to the
//! waiting task through a oneshot channel. Requests carrying neither get a
//! 400 and leave the waiter pending.

use std::future::IntoFuture;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::thread::JoinHandle;

use axum::{
    Router,
    extract::{RawQuery, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Path the authorization server redirects to
pub const CALLBACK_PATH: &str = "/callback";

/// OAuth callback query parameters
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,

    /// State parameter (for CSRF protection)
    pub state: Option<String>,

    /// Error code
    pub error: Option<String>,

    /// Error description
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parse a raw query string. The first non-empty value of each key wins.
    pub fn parse(query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            let slot = match key.as_ref() {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        params
    }
}

/// Successful redirect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackResult {
    /// Authorization code
    pub code: String,

    /// State parameter, if the server echoed one
    pub state: Option<String>,
}

/// State shared with the callback handler
struct CallbackState {
    tx: Mutex<Option<oneshot::Sender<Result<CallbackResult>>>>,
}

impl CallbackState {
    /// Deliver the result to the waiter. Returns `false` if one was already delivered.
    fn resolve(&self, result: Result<CallbackResult>) -> bool {
        match self.tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

/// Loopback receiver for a single OAuth redirect
pub struct CallbackReceiver {
    addr: SocketAddr,
    listener: Mutex<Option<StdTcpListener>>,
    state: Arc<CallbackState>,
    rx: Mutex<Option<oneshot::Receiver<Result<CallbackResult>>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackReceiver {
    /// Bind to an OS-assigned port on 127.0.0.1 without serving yet
    pub fn bind() -> Result<Self> {
        let listener = StdTcpListener::bind(("127.0.0.1", 0))
            .map_err(|e| Error::Internal(format!("Failed to bind callback server: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Internal(format!("Failed to get callback server address: {e}")))?;

        let (tx, rx) = oneshot::channel();

        Ok(Self {
            addr,
            listener: Mutex::new(Some(listener)),
            state: Arc::new(CallbackState {
                tx: Mutex::new(Some(tx)),
            }),
            rx: Mutex::new(Some(rx)),
            shutdown_tx: Mutex::new(None),
            thread: Mutex::new(None),
        })
    }

    /// Port the receiver is bound to
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Redirect URI to register with the authorization server
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{CALLBACK_PATH}", self.port())
    }

    /// Start serving on a background thread. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        let Some(listener) = self.listener.lock().take() else {
            return Ok(());
        };
        listener.set_nonblocking(true)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let state = Arc::clone(&self.state);

        let handle = std::thread::Builder::new()
            .name("oauth-callback".to_string())
            .spawn(move || serve(listener, state, shutdown_rx))?;

        *self.shutdown_tx.lock() = Some(shutdown_tx);
        *self.thread.lock() = Some(handle);

        info!(url = %self.redirect_uri(), "OAuth callback server listening");
        Ok(())
    }

    /// Shut the listener down. Safe to call repeatedly, before `start`, or
    /// after a result arrived. Does not wait for the thread to exit.
    pub fn stop(&self) {
        // Never started: dropping the socket is enough
        drop(self.listener.lock().take());

        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
            debug!(port = self.port(), "OAuth callback server stopping");
        }

        // Wake a pending waiter instead of leaving it suspended forever
        drop(self.state.tx.lock().take());
        drop(self.thread.lock().take());
    }

    /// Wait for the redirect. No timeout is applied here.
    ///
    /// Resolves with the code and state, or fails with the error reported
    /// by the authorization server. Only one caller may wait.
    pub async fn await_callback(&self) -> Result<CallbackResult> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("OAuth callback already awaited".to_string()))?;

        rx.await.map_err(|_| {
            Error::Internal("OAuth callback server stopped before a redirect arrived".to_string())
        })?
    }
}

impl Drop for CallbackReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Body of the listener thread
fn serve(listener: StdTcpListener, state: Arc<CallbackState>, shutdown_rx: oneshot::Receiver<()>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!(error = %e, "Failed to start OAuth callback runtime");
            state.resolve(Err(Error::Internal(format!(
                "Failed to start OAuth callback runtime: {e}"
            ))));
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                state.resolve(Err(Error::Internal(format!(
                    "Failed to register callback listener: {e}"
                ))));
                return;
            }
        };

        let app = Router::new()
            .route(CALLBACK_PATH, get(handle_callback))
            .with_state(Arc::clone(&state));

        tokio::select! {
            result = axum::serve(listener, app).into_future() => {
                if let Err(e) = result {
                    warn!(error = %e, "OAuth callback server error");
                    state.resolve(Err(Error::Internal(format!("Callback server error: {e}"))));
                }
            }
            _ = shutdown_rx => {
                debug!("OAuth callback server shut down");
            }
        }
    });
}

/// Handle the OAuth callback
async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = CallbackParams::parse(query.as_deref().unwrap_or_default());
    debug!(
        has_code = params.code.is_some(),
        has_state = params.state.is_some(),
        error = ?params.error,
        "Received OAuth callback"
    );

    if let Some(error) = params.error {
        let message = match &params.error_description {
            Some(description) => format!("OAuth error: {error} - {description}"),
            None => format!("OAuth error: {error}"),
        };
        if !state.resolve(Err(Error::Callback(message))) {
            return already_completed();
        }
        let description = params.error_description.as_deref().unwrap_or(error.as_str());
        return (StatusCode::BAD_REQUEST, Html(error_page(&error, description))).into_response();
    }

    let Some(code) = params.code else {
        return (
            StatusCode::BAD_REQUEST,
            Html(error_page("missing_code", "Missing code parameter")),
        )
            .into_response();
    };

    let result = CallbackResult {
        code,
        state: params.state,
    };
    if !state.resolve(Ok(result)) {
        return already_completed();
    }

    (StatusCode::OK, Html(success_page())).into_response()
}

fn already_completed() -> Response {
    (
        StatusCode::CONFLICT,
        Html(error_page(
            "already_completed",
            "This authorization has already completed. You can close this tab.",
        )),
    )
        .into_response()
}

/// Escape HTML special characters
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn success_page() -> &'static str {
    r#"<!DOCTYPE html>
<html>
<head>
    <title>Authentication Successful</title>
    <style>
        body { font-family: system-ui, -apple-system, sans-serif; text-align: center; padding: 3em; }
        h1 { margin: 0 0 0.5rem 0; }
        p { margin: 0; opacity: 0.8; }
    </style>
</head>
<body>
    <h1>&#x2705; Authentication Successful</h1>
    <p>You can close this tab and return to the terminal.</p>
</body>
</html>"#
}

fn error_page(error: &str, description: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Authentication Failed</title>
    <style>
        body {{ font-family: system-ui, -apple-system, sans-serif; text-align: center; padding: 3em; }}
        h1 {{ margin: 0 0 0.5rem 0; }}
        p {{ margin: 0; opacity: 0.8; }}
        .error-code {{ font-family: monospace; margin-top: 1rem; opacity: 0.6; }}
    </style>
</head>
<body>
    <h1>&#x274c; Authentication Failed</h1>
    <p>{}</p>
    <p class="error-code">Error: {}</p>
</body>
</html>"#,
        html_escape(description),
        html_escape(error)
    )
}
