//! GraphQL client for the Secure Gate authorization service.
//!
//! The service speaks plain GraphQL-over-HTTP: every call is a POST with a
//! `{"query": …, "variables": …}` body and a `{"data": …}` envelope back.
//! After a successful `auth`, the JWT is attached to every request as
//! `Authorization: JWT <token>`.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{CoreError, Result};

/// Identity of the logged-in operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "firstName")]
    pub first_name: String,
    #[serde(default, rename = "lastName")]
    pub last_name: String,
    #[serde(default)]
    pub job: String,
}

/// One machine the operator may access. Identity is the `id`; name and
/// network coordinates drift and are refreshed on every poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default, rename = "agentPort")]
    pub agent_port: u16,
}

/// Outcome of an `auth` query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Auth {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub message: String,
}

/// One audited line shipped back to the service.
#[derive(Debug, Clone, Serialize)]
pub struct MachineLogInput {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(rename = "machineId")]
    pub machine_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub log: String,
}

/// Remote operations offered by the authorization service.
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn auth(&self, email: &str, password: &str, deadline: Duration) -> Result<Auth>;
    /// Attach the JWT used by every subsequent call. Only the login path
    /// mutates the token, so readers never race a writer in practice.
    fn set_token(&self, token: &str);
    async fn me(&self, deadline: Duration) -> Result<Operator>;
    async fn machines(&self, deadline: Duration) -> Result<Vec<Machine>>;
    async fn add_machine_log(&self, batch: &[MachineLogInput], deadline: Duration) -> Result<()>;
}

const AUTH_QUERY: &str = "\
query auth($email: String!, $password: String!) {
  auth(email: $email, password: $password) {
    success
    token
    message
  }
}";

const MACHINES_QUERY: &str = "\
query machines {
  machines {
    id
    name
    ip
    agentPort
  }
}";

const ME_QUERY: &str = "\
query operatorInfos {
  user: me {
    id
    email
    firstName
    lastName
    job
  }
}";

const ADD_MACHINE_LOG_MUTATION: &str = "\
mutation addMachineLog($machineLogs: [MachineLogInput!]!) {
  addMachineLog(machineLogs: $machineLogs) {
    success
  }
}";

#[derive(Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct AuthData {
    auth: Auth,
}

#[derive(Deserialize)]
struct MachinesData {
    machines: Vec<Machine>,
}

#[derive(Deserialize)]
struct MeData {
    user: Operator,
}

#[derive(Deserialize)]
struct AddMachineLogData {
    #[serde(rename = "addMachineLog")]
    add_machine_log: BaseResult,
}

#[derive(Deserialize)]
struct BaseResult {
    #[serde(default)]
    success: bool,
}

/// HTTP implementation of [`BackendApi`].
pub struct BackendClient {
    http: reqwest::Client,
    endpoint: String,
    token: RwLock<Option<String>>,
}

impl BackendClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            token: RwLock::new(None),
        }
    }

    async fn run<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
        deadline: Duration,
    ) -> Result<T> {
        let mut req = self
            .http
            .post(&self.endpoint)
            .timeout(deadline)
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(token) = self.token.read().expect("token lock poisoned").as_deref() {
            req = req.header("Authorization", format!("JWT {token}"));
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::Transport(format!(
                "authorization service answered {status}"
            )));
        }

        let envelope: Envelope<T> = resp
            .json()
            .await
            .map_err(|e| CoreError::Transport(format!("undecodable response body: {e}")))?;
        if let Some(errors) = envelope.errors {
            let message = errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(CoreError::Transport(message));
        }
        envelope
            .data
            .ok_or_else(|| CoreError::Transport("response carried no data".to_string()))
    }
}

#[async_trait]
impl BackendApi for BackendClient {
    async fn auth(&self, email: &str, password: &str, deadline: Duration) -> Result<Auth> {
        let data: AuthData = self
            .run(
                AUTH_QUERY,
                json!({ "email": email, "password": password }),
                deadline,
            )
            .await?;
        Ok(data.auth)
    }

    fn set_token(&self, token: &str) {
        *self.token.write().expect("token lock poisoned") = Some(token.to_string());
    }

    async fn me(&self, deadline: Duration) -> Result<Operator> {
        let data: MeData = self.run(ME_QUERY, json!({}), deadline).await?;
        Ok(data.user)
    }

    async fn machines(&self, deadline: Duration) -> Result<Vec<Machine>> {
        let data: MachinesData = self.run(MACHINES_QUERY, json!({}), deadline).await?;
        Ok(data.machines)
    }

    async fn add_machine_log(&self, batch: &[MachineLogInput], deadline: Duration) -> Result<()> {
        let data: AddMachineLogData = self
            .run(
                ADD_MACHINE_LOG_MUTATION,
                json!({ "machineLogs": batch }),
                deadline,
            )
            .await?;
        if !data.add_machine_log.success {
            return Err(CoreError::Transport(
                "authorization service did not accept the machine logs".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::graphql_fixture;

    #[tokio::test]
    async fn auth_decodes_the_auth_envelope() {
        let server = graphql_fixture(serde_json::json!({
            "data": {
                "auth": { "success": true, "token": "tok-1", "message": "welcome" }
            }
        }))
        .await;

        let client = BackendClient::new(server.endpoint());
        let auth = client
            .auth("a@x", "pw", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(auth.success);
        assert_eq!(auth.token, "tok-1");
    }

    #[tokio::test]
    async fn machines_decodes_the_inventory() {
        let server = graphql_fixture(serde_json::json!({
            "data": {
                "machines": [
                    { "id": "m1", "name": "alpha", "ip": "127.0.0.1", "agentPort": 3001 },
                    { "id": "m2", "name": "beta", "ip": "127.0.0.2", "agentPort": 3002 }
                ]
            }
        }))
        .await;

        let client = BackendClient::new(server.endpoint());
        let machines = client.machines(Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            machines,
            vec![
                Machine {
                    id: "m1".into(),
                    name: "alpha".into(),
                    ip: "127.0.0.1".into(),
                    agent_port: 3001,
                },
                Machine {
                    id: "m2".into(),
                    name: "beta".into(),
                    ip: "127.0.0.2".into(),
                    agent_port: 3002,
                },
            ]
        );
    }

    #[tokio::test]
    async fn me_decodes_the_operator() {
        let server = graphql_fixture(serde_json::json!({
            "data": {
                "user": {
                    "id": "u1",
                    "email": "admin@x",
                    "firstName": "Ada",
                    "lastName": "Lovelace",
                    "job": "ops"
                }
            }
        }))
        .await;

        let client = BackendClient::new(server.endpoint());
        let operator = client.me(Duration::from_secs(5)).await.unwrap();
        assert_eq!(operator.id, "u1");
        assert_eq!(operator.first_name, "Ada");
    }

    #[tokio::test]
    async fn graphql_errors_become_transport_failures() {
        let server = graphql_fixture(serde_json::json!({
            "errors": [ { "message": "not authorized" } ]
        }))
        .await;

        let client = BackendClient::new(server.endpoint());
        let err = client.machines(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, CoreError::Transport(msg) if msg.contains("not authorized")));
    }
}
