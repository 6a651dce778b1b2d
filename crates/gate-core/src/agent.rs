//! REST client for the agents running on remote machines.
//!
//! An agent's only job is to edit its machine's SSH authorization file:
//! POST installs the operator's public key, DELETE removes it. Both carry
//! the shared agent secret, which is distinct from the operator's JWT.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::{CoreError, Result};

/// Ceiling applied to every single agent call.
pub const AGENT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Key mutations offered by a remote agent.
#[async_trait]
pub trait AgentApi: Send + Sync {
    /// Install `key` in the authorization file for `operator_id` on the
    /// agent at `endpoint` (scheme + host + port).
    async fn add_authorized_key(&self, endpoint: &str, operator_id: &str, key: &str)
        -> Result<()>;
    /// Remove `key` from the authorization file for `operator_id`.
    async fn delete_authorized_key(
        &self,
        endpoint: &str,
        operator_id: &str,
        key: &str,
    ) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct SshAuthResponse {
    #[serde(default, rename = "ErrorType")]
    error_type: String,
    #[serde(default, rename = "Message")]
    message: String,
}

/// HTTP implementation of [`AgentApi`].
pub struct AgentClient {
    http: reqwest::Client,
    auth_token: String,
}

impl AgentClient {
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth_token: auth_token.into(),
        }
    }

    async fn send(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        operator_id: &str,
        key: &str,
    ) -> Result<()> {
        let url = format!("{endpoint}/gate/users/{operator_id}/ssh-authorization");
        let resp = self
            .http
            .request(method, &url)
            .timeout(AGENT_CALL_TIMEOUT)
            .header("Authorization", format!("Bearer {}", self.auth_token))
            .header("Accept", "application/json")
            .json(&json!({ "publicKey": key.trim() }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::Transport(format!(
                "agent at {endpoint} answered {status}"
            )));
        }

        let body: SshAuthResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::Transport(format!("undecodable agent response: {e}")))?;
        if !body.error_type.is_empty() {
            return Err(CoreError::AgentRejected {
                endpoint: endpoint.to_string(),
                message: body.message,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AgentApi for AgentClient {
    async fn add_authorized_key(
        &self,
        endpoint: &str,
        operator_id: &str,
        key: &str,
    ) -> Result<()> {
        self.send(reqwest::Method::POST, endpoint, operator_id, key)
            .await
    }

    async fn delete_authorized_key(
        &self,
        endpoint: &str,
        operator_id: &str,
        key: &str,
    ) -> Result<()> {
        self.send(reqwest::Method::DELETE, endpoint, operator_id, key)
            .await
    }
}
