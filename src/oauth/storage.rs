//! OAuth Token Storage
//!
//! Persists OAuth tokens and client registrations to disk, one JSON record
//! per downstream server, so a browser round-trip is only needed once.
//!
//! Record layout (`<dir>/<server>.json`, mode 0600):
//!
//! ```json
//! { "tokens": { ... }, "client_info": { ... } }
//! ```
//!
//! Both keys are optional and decoded independently. A missing, unreadable or
//! malformed file reads as an empty record.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{Error, Result};

const TOKENS_KEY: &str = "tokens";
const CLIENT_INFO_KEY: &str = "client_info";

/// OAuth credential issued by a downstream authorization server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Access token
    pub access_token: String,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Refresh token (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Token expiration time (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,

    /// Granted scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Credential {
    /// Credential with only an access token and the default token type
    #[must_use]
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            refresh_token: None,
            expires_at: None,
            scope: None,
        }
    }

    /// Create a credential from a token endpoint response
    #[must_use]
    pub fn from_response(
        access_token: String,
        token_type: Option<String>,
        refresh_token: Option<String>,
        expires_in: Option<u64>,
        scope: Option<String>,
    ) -> Self {
        Self {
            access_token,
            token_type: token_type.unwrap_or_else(default_token_type),
            refresh_token,
            expires_at: expires_in.map(|secs| unix_now() + secs),
            scope,
        }
    }

    /// Check if the token is expired (with 60 second buffer)
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| unix_now() + 60 >= expires_at)
    }

    /// Time until expiration
    pub fn time_until_expiry(&self) -> Option<Duration> {
        let now = unix_now();
        self.expires_at
            .filter(|&expires_at| expires_at > now)
            .map(|expires_at| Duration::from_secs(expires_at - now))
    }
}

/// Dynamic client registration result (RFC 7591)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    /// Client identifier issued by the authorization server
    pub client_id: String,

    /// Client secret, absent for public clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Redirect URIs registered for this client, in order
    #[serde(default)]
    pub redirect_uris: Vec<String>,

    /// Human-readable client name echoed by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

impl ClientRegistration {
    /// Whether this registration can be reused with `redirect_uri`
    pub fn accepts_redirect(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }
}

/// File-backed token cache rooted at a directory
#[derive(Debug, Clone)]
pub struct TokenStore {
    /// Base directory for token storage (created lazily on first write)
    base_dir: PathBuf,
}

impl TokenStore {
    /// Create a token store rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Directory the records live in
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the record file for `server_name`
    ///
    /// # Errors
    ///
    /// Returns a config error if the name could escape the base directory.
    pub fn record_path(&self, server_name: &str) -> Result<PathBuf> {
        if !is_valid_server_name(server_name) {
            return Err(Error::Config(format!(
                "Invalid server name for token storage: {server_name:?}"
            )));
        }
        Ok(self.base_dir.join(format!("{server_name}.json")))
    }

    /// Load the cached credential for a server.
    ///
    /// Records that carry only a relative `expires_in` are treated as
    /// non-expiring; the issue time was never stored.
    pub fn get_tokens(&self, server_name: &str) -> Option<Credential> {
        let value = self.read_value(server_name, TOKENS_KEY)?;
        if value.get("expires_in").is_some() && value.get("expires_at").is_none() {
            debug!(
                server = %server_name,
                "Stored token has expires_in but no expires_at, treating it as non-expiring"
            );
        }
        let token: Credential = decode_entry(server_name, TOKENS_KEY, value)?;
        if token.is_expired() {
            debug!(server = %server_name, "Stored token is expired");
        } else {
            debug!(server = %server_name, expires_in = ?token.time_until_expiry(), "Loaded stored token");
        }
        Some(token)
    }

    /// Save the credential for a server, keeping any client registration
    pub fn set_tokens(&self, server_name: &str, token: &Credential) -> Result<()> {
        self.write_entry(server_name, TOKENS_KEY, serde_json::to_value(token)?)?;
        info!(server = %server_name, "Saved OAuth token");
        Ok(())
    }

    /// Load the cached client registration for a server
    pub fn get_client_info(&self, server_name: &str) -> Option<ClientRegistration> {
        let value = self.read_value(server_name, CLIENT_INFO_KEY)?;
        decode_entry(server_name, CLIENT_INFO_KEY, value)
    }

    /// Save the client registration for a server, keeping any credential
    pub fn set_client_info(&self, server_name: &str, info: &ClientRegistration) -> Result<()> {
        self.write_entry(server_name, CLIENT_INFO_KEY, serde_json::to_value(info)?)?;
        info!(server = %server_name, client_id = %info.client_id, "Saved OAuth client registration");
        Ok(())
    }

    /// Names of all servers with a record on disk, sorted
    pub fn list_servers(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") && path.is_file() {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete the record for a server. Returns whether a record existed.
    pub fn clear(&self, server_name: &str) -> Result<bool> {
        let path = self.record_path(server_name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(server = %server_name, "Cleared OAuth record");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read_record(server_name: &str, path: &Path) -> Map<String, Value> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(server = %server_name, "No stored OAuth record found");
                return Map::new();
            }
            Err(e) => {
                warn!(server = %server_name, error = %e, "Failed to read OAuth record");
                return Map::new();
            }
        };

        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!(server = %server_name, "OAuth record is not a JSON object");
                Map::new()
            }
            Err(e) => {
                warn!(server = %server_name, error = %e, "Failed to parse OAuth record");
                Map::new()
            }
        }
    }

    fn read_value(&self, server_name: &str, key: &str) -> Option<Value> {
        let path = match self.record_path(server_name) {
            Ok(path) => path,
            Err(e) => {
                warn!(server = %server_name, error = %e, "Refusing to read OAuth record");
                return None;
            }
        };
        Self::read_record(server_name, &path).remove(key)
    }

    fn write_entry(&self, server_name: &str, key: &str, value: Value) -> Result<()> {
        let path = self.record_path(server_name)?;
        let mut record = Self::read_record(server_name, &path);
        record.insert(key.to_string(), value);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(&Value::Object(record))?;
        fs::write(&path, content)?;

        // Owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

fn decode_entry<T: DeserializeOwned>(server_name: &str, key: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!(server = %server_name, key, error = %e, "Ignoring malformed OAuth record entry");
            None
        }
    }
}

/// Server names become file names, so they must not escape the directory
fn is_valid_server_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, TokenStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens"));
        (dir, store)
    }

    fn registration() -> ClientRegistration {
        ClientRegistration {
            client_id: "cid".to_string(),
            client_secret: Some("csec".to_string()),
            redirect_uris: vec!["http://localhost/cb".to_string()],
            client_name: None,
        }
    }

    #[test]
    fn test_token_expiry() {
        let token = Credential::from_response("test_token".to_string(), None, None, Some(3600), None);
        assert!(!token.is_expired());
        assert!(token.time_until_expiry().is_some());

        let mut expired = token.clone();
        expired.expires_at = Some(0);
        assert!(expired.is_expired());
        assert!(expired.time_until_expiry().is_none());
    }

    #[test]
    fn test_token_no_expiry() {
        let token = Credential::from_response("test_token".to_string(), None, None, None, None);
        assert!(!token.is_expired());
        assert_eq!(token.token_type, "Bearer");
    }

    #[test]
    fn get_tokens_empty() {
        let (_dir, store) = store();
        assert!(store.get_tokens("testserver").is_none());
        assert!(store.get_client_info("testserver").is_none());
    }

    #[test]
    fn set_and_get_tokens_round_trips_every_field() {
        let (_dir, store) = store();
        let token = Credential {
            access_token: "abc123".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(1_900_000_000),
            scope: Some("read write".to_string()),
        };
        store.set_tokens("testserver", &token).unwrap();
        assert_eq!(store.get_tokens("testserver"), Some(token.clone()));

        // Writing the same credential again changes nothing
        store.set_tokens("testserver", &token).unwrap();
        assert_eq!(store.get_tokens("testserver"), Some(token));
    }

    #[test]
    fn set_tokens_creates_directory_and_record_file() {
        let (_dir, store) = store();
        assert!(!store.base_dir().exists());
        store.set_tokens("testserver", &Credential::bearer("x")).unwrap();
        assert!(store.record_path("testserver").unwrap().is_file());
    }

    #[cfg(unix)]
    #[test]
    fn record_file_is_owner_read_write_only() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, store) = store();
        store.set_tokens("testserver", &Credential::bearer("secret")).unwrap();
        let mode = fs::metadata(store.record_path("testserver").unwrap()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        store.set_client_info("other", &registration()).unwrap();
        let mode = fs::metadata(store.record_path("other").unwrap()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn rewrite_tightens_existing_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, store) = store();
        fs::create_dir_all(store.base_dir()).unwrap();
        let path = store.record_path("loose").unwrap();
        fs::write(&path, "{}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        store.set_tokens("loose", &Credential::bearer("tok")).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupted_file_reads_as_empty() {
        let (_dir, store) = store();
        fs::create_dir_all(store.base_dir()).unwrap();
        fs::write(store.record_path("testserver").unwrap(), "not valid json {{{").unwrap();
        assert!(store.get_tokens("testserver").is_none());
        assert!(store.get_client_info("testserver").is_none());
    }

    #[test]
    fn non_object_record_reads_as_empty() {
        let (_dir, store) = store();
        fs::create_dir_all(store.base_dir()).unwrap();
        fs::write(store.record_path("testserver").unwrap(), "[1, 2, 3]").unwrap();
        assert!(store.get_tokens("testserver").is_none());
    }

    #[test]
    fn malformed_client_info_is_absent() {
        let (_dir, store) = store();
        fs::create_dir_all(store.base_dir()).unwrap();
        fs::write(store.record_path("testserver").unwrap(), r#"{"client_info": "not a dict"}"#).unwrap();
        assert!(store.get_client_info("testserver").is_none());
    }

    #[test]
    fn entries_decode_independently() {
        let (_dir, store) = store();
        fs::create_dir_all(store.base_dir()).unwrap();
        fs::write(
            store.record_path("mixed").unwrap(),
            r#"{"tokens": {"token_type": "Bearer"}, "client_info": {"client_id": "cid"}}"#,
        )
        .unwrap();
        assert!(store.get_tokens("mixed").is_none());
        assert_eq!(store.get_client_info("mixed").unwrap().client_id, "cid");
    }

    #[test]
    fn missing_token_type_defaults_to_bearer() {
        let (_dir, store) = store();
        fs::create_dir_all(store.base_dir()).unwrap();
        fs::write(store.record_path("s").unwrap(), r#"{"tokens": {"access_token": "tok"}}"#).unwrap();
        assert_eq!(store.get_tokens("s").unwrap().token_type, "Bearer");
    }

    #[test]
    fn set_and_get_client_info() {
        let (_dir, store) = store();
        store.set_client_info("testserver", &registration()).unwrap();
        let loaded = store.get_client_info("testserver").unwrap();
        assert_eq!(loaded, registration());
        assert!(loaded.accepts_redirect("http://localhost/cb"));
        assert!(!loaded.accepts_redirect("http://127.0.0.1:1/callback"));
    }

    #[test]
    fn set_tokens_preserves_client_info() {
        let (_dir, store) = store();
        store.set_client_info("testserver", &registration()).unwrap();
        store.set_tokens("testserver", &Credential::bearer("tok")).unwrap();

        assert_eq!(store.get_tokens("testserver").unwrap().access_token, "tok");
        assert_eq!(store.get_client_info("testserver"), Some(registration()));
    }

    #[test]
    fn set_client_info_preserves_tokens() {
        let (_dir, store) = store();
        store.set_tokens("testserver", &Credential::bearer("tok")).unwrap();
        store.set_client_info("testserver", &registration()).unwrap();

        assert_eq!(store.get_tokens("testserver"), Some(Credential::bearer("tok")));
    }

    #[test]
    fn write_over_corrupted_file_recovers() {
        let (_dir, store) = store();
        fs::create_dir_all(store.base_dir()).unwrap();
        fs::write(store.record_path("s").unwrap(), "garbage").unwrap();
        store.set_tokens("s", &Credential::bearer("tok")).unwrap();
        assert_eq!(store.get_tokens("s").unwrap().access_token, "tok");
    }

    #[test]
    fn rejects_names_that_escape_the_directory() {
        let (_dir, store) = store();
        assert!(store.set_tokens("../evil", &Credential::bearer("x")).is_err());
        assert!(store.set_tokens("", &Credential::bearer("x")).is_err());
        assert!(matches!(store.record_path("a/b"), Err(Error::Config(_))));
        assert!(store.record_path("..").is_err());
    }

    #[test]
    fn reads_never_leave_the_directory() {
        let (dir, store) = store();
        fs::create_dir_all(store.base_dir()).unwrap();
        fs::write(
            dir.path().join("outside.json"),
            r#"{"tokens": {"access_token": "leaked"}, "client_info": {"client_id": "cid"}}"#,
        )
        .unwrap();

        assert!(store.get_tokens("../outside").is_none());
        assert!(store.get_client_info("../outside").is_none());
    }

    #[test]
    fn clear_refuses_names_outside_the_directory() {
        let (dir, store) = store();
        fs::create_dir_all(store.base_dir()).unwrap();
        let outside = dir.path().join("x.json");
        fs::write(&outside, "{}").unwrap();

        assert!(matches!(store.clear("../x"), Err(Error::Config(_))));
        assert!(outside.exists());
    }

    #[test]
    fn relative_expiry_record_reads_as_non_expiring() {
        let (_dir, store) = store();
        fs::create_dir_all(store.base_dir()).unwrap();
        fs::write(
            store.record_path("legacy").unwrap(),
            r#"{"tokens": {"access_token": "tok", "token_type": "Bearer", "expires_in": 3600}}"#,
        )
        .unwrap();

        let token = store.get_tokens("legacy").unwrap();
        assert_eq!(token.access_token, "tok");
        assert_eq!(token.expires_at, None);
        assert!(!token.is_expired());
    }

    #[test]
    fn list_servers_sorted_and_ignores_other_files() {
        let (_dir, store) = store();
        assert!(store.list_servers().unwrap().is_empty());

        store.set_tokens("zeta", &Credential::bearer("z")).unwrap();
        store.set_tokens("alpha", &Credential::bearer("a")).unwrap();
        fs::write(store.base_dir().join("notes.txt"), "hi").unwrap();

        assert_eq!(store.list_servers().unwrap(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn clear_removes_only_the_named_record() {
        let (_dir, store) = store();
        store.set_tokens("a", &Credential::bearer("a")).unwrap();
        store.set_tokens("b", &Credential::bearer("b")).unwrap();

        assert!(store.clear("a").unwrap());
        assert!(!store.clear("a").unwrap());
        assert!(store.get_tokens("a").is_none());
        assert_eq!(store.get_tokens("b").unwrap().access_token, "b");
    }
}
