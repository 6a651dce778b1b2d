//! Configuration loaded from a TOML file.
//!
//! Every key has a default so a minimal file only needs `backend_uri` and
//! `agent_authentication_token`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Runtime configuration of the gate process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Login name used when dialing remote machines over SSH.
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    /// Authorization service endpoint.
    #[serde(default)]
    pub backend_uri: String,

    /// Shared bearer secret presented to remote agents.
    #[serde(default)]
    pub agent_authentication_token: String,

    /// Message catalog key for operator-facing strings.
    #[serde(default = "default_language")]
    pub language: String,

    /// Directory holding the persistent machine store.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Audit log file.
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
}

fn default_ssh_user() -> String {
    "secure".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/securegate/gate/securegate.db")
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/securegate/gate/gate.log")
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            ssh_user: default_ssh_user(),
            backend_uri: String::new(),
            agent_authentication_token: String::new(),
            language: default_language(),
            db_path: default_db_path(),
            log_path: default_log_path(),
        }
    }
}

impl Configuration {
    /// Load the configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Persistence(format!("could not read {}: {e}", path.display()))
        })?;
        toml::from_str(&raw).map_err(|e| {
            CoreError::Persistence(format!("could not parse {}: {e}", path.display()))
        })
    }
}
