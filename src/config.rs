//! Configuration management

use std::{
    collections::{BTreeMap, HashMap},
    env,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable naming the config file when no path is given
pub const CONFIG_ENV_VAR: &str = "AGENT_MCP_CONFIG";

/// Token directory used when the config does not set one
pub const DEFAULT_TOKEN_DIR: &str = "~/.agent-mcp/tokens";

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env var pattern")
});

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Directory holding one OAuth record per server
    pub token_dir: PathBuf,
    /// Downstream servers keyed by name
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            token_dir: PathBuf::from(DEFAULT_TOKEN_DIR),
            servers: BTreeMap::new(),
        }
    }
}

/// Downstream server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server name, taken from its key in `servers`
    #[serde(skip)]
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// How the server is reached
    pub transport: TransportKind,
    /// Command to execute (stdio)
    pub command: Option<String>,
    /// Command arguments (stdio)
    pub args: Vec<String>,
    /// Extra environment for the command (stdio)
    pub env: HashMap<String, String>,
    /// Server URL (http)
    pub url: Option<String>,
    /// Static request headers (http)
    pub headers: HashMap<String, String>,
    /// Authentication mode
    pub auth: Option<AuthMode>,
    /// OAuth client settings, used when `auth: oauth`
    pub oauth: OAuthSettings,
}

/// Transport used to reach a downstream server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Subprocess speaking over stdin/stdout
    #[default]
    Stdio,
    /// Streamable HTTP endpoint
    Http,
}

/// Authentication mode for a downstream server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMode {
    /// Browser-based OAuth authorization code flow
    #[serde(rename = "oauth")]
    OAuth,
}

/// OAuth client settings for a backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    /// OAuth scopes to request (if empty, uses server's advertised scopes)
    pub scopes: Vec<String>,
    /// Client ID (optional - uses dynamic registration if not set)
    pub client_id: Option<String>,
}

impl ServerConfig {
    /// Whether requests to this server need an OAuth bearer token
    pub fn uses_oauth(&self) -> bool {
        self.auth == Some(AuthMode::OAuth)
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Path resolution: `path`, then `$AGENT_MCP_CONFIG`, then `./config.yaml`.
    /// `AGENT_MCP_`-prefixed variables override file values (`__` nests).
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(
            || {
                env::var_os(CONFIG_ENV_VAR)
                    .map_or_else(|| PathBuf::from("config.yaml"), PathBuf::from)
            },
            Path::to_path_buf,
        );

        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let mut config: Self = Figment::new()
            .merge(Yaml::file(&path))
            .merge(Env::prefixed("AGENT_MCP_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();

        config.expand_env_vars();
        config.token_dir = expand_tilde(&config.token_dir.to_string_lossy());

        for (name, server) in &mut config.servers {
            server.name.clone_from(name);
        }

        tracing::debug!(
            path = %path.display(),
            servers = config.servers.len(),
            token_dir = %config.token_dir.display(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = expand_tilde(path_str);
            if path.exists() {
                match dotenvy::from_path(&path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {}", path.display());
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {}: {e}", path.display());
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {}", path.display());
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in every server string
    /// and in the token directory
    fn expand_env_vars(&mut self) {
        self.token_dir = PathBuf::from(expand_string(&self.token_dir.to_string_lossy()));

        for server in self.servers.values_mut() {
            server.description = expand_string(&server.description);
            for value in server
                .command
                .iter_mut()
                .chain(server.url.iter_mut())
                .chain(server.oauth.client_id.iter_mut())
                .chain(server.args.iter_mut())
                .chain(server.env.values_mut())
                .chain(server.headers.values_mut())
                .chain(server.oauth.scopes.iter_mut())
            {
                *value = expand_string(value);
            }
        }
    }

    /// Servers in name order
    pub fn servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.values()
    }

    /// Servers that authenticate with OAuth
    pub fn oauth_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers().filter(|s| s.uses_oauth())
    }
}

/// Expand environment variables in a string; unset variables without a
/// default become empty
pub fn expand_string(value: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
}

/// Replace a leading `~` with the home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest.trim_start_matches('/'));
            }
        }
    }
    PathBuf::from(path)
}
