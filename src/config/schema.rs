use serde::Deserialize;

use crate::datasource::TxKind;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    /// Backend used by the bundled MySQL adapter
    #[serde(default)]
    pub backend: BackendConfig,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// What BEGIN does while the connection already has a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NestedBeginPolicy {
    /// Fail the BEGIN and keep the open transaction
    #[default]
    Reject,
    /// Commit the open transaction first (MySQL implicit commit)
    CommitPrevious,
    /// Roll back the open transaction first
    RollbackPrevious,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Transaction kind handed to the data source on BEGIN
    #[serde(default)]
    pub tx_kind: TxKind,
    #[serde(default)]
    pub nested_begin: NestedBeginPolicy,
    /// Fail a command that overlaps another on the same connection
    #[serde(default = "default_enforce_single_flight")]
    pub enforce_single_flight: bool,
}

fn default_enforce_single_flight() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tx_kind: TxKind::default(),
            nested_begin: NestedBeginPolicy::default(),
            enforce_single_flight: default_enforce_single_flight(),
        }
    }
}

// ============================================================================
// Backend Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_host")]
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    #[serde(default = "default_backend_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port() -> u16 {
    3306
}

fn default_backend_user() -> String {
    "root".to_string()
}

impl BackendConfig {
    /// Get the address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_backend_host(),
            port: default_backend_port(),
            user: default_backend_user(),
            password: String::new(),
            database: None,
        }
    }
}
