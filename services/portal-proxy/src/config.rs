//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Tokens never live in the TOML; the file only says where the token file is.

use portal_auth::{AuthEndpoints, DEFAULT_REFRESH_TIMEOUT_SECS, LOGIN_PATH, REFRESH_PATH};
use portal_session::SessionSettings;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Token lifecycle settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Where the token pair is persisted. `None` keeps it in memory only.
    pub token_file: Option<PathBuf>,
    pub refresh_path: String,
    pub login_path: String,
    pub refresh_timeout_secs: u64,
    pub proactive_refresh: bool,
    pub refresh_interval_secs: u64,
    pub refresh_threshold_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_file: None,
            refresh_path: REFRESH_PATH.to_string(),
            login_path: LOGIN_PATH.to_string(),
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
            proactive_refresh: true,
            refresh_interval_secs: 60,
            refresh_threshold_secs: 120,
        }
    }
}

impl SessionConfig {
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            endpoints: AuthEndpoints {
                refresh_path: self.refresh_path.clone(),
                login_path: self.login_path.clone(),
            },
            refresh_timeout: Duration::from_secs(self.refresh_timeout_secs),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// - `PORTAL_UPSTREAM_URL` replaces `proxy.upstream_url`
    /// - `PORTAL_TOKEN_FILE` replaces `session.token_file`
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| common::Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("PORTAL_UPSTREAM_URL") {
            config.proxy.upstream_url = url;
        }
        if let Ok(file) = std::env::var("PORTAL_TOKEN_FILE") {
            config.session.token_file = Some(PathBuf::from(file));
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.proxy.upstream_url.starts_with("http://")
            && !self.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                self.proxy.upstream_url
            )));
        }

        if self.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        for (name, value) in [
            ("refresh_path", &self.session.refresh_path),
            ("login_path", &self.session.login_path),
        ] {
            if !value.starts_with('/') {
                return Err(common::Error::Config(format!(
                    "{name} must start with '/', got: {value}"
                )));
            }
        }

        if self.session.refresh_timeout_secs == 0 {
            return Err(common::Error::Config(
                "refresh_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.session.refresh_interval_secs == 0 {
            return Err(common::Error::Config(
                "refresh_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("campus-portal-proxy.toml")
    }
}
