//! Shared fixtures for the crate's tests: in-process HTTP servers standing
//! in for the authorization service and the agents, plus in-memory fakes
//! of the service traits.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::to_bytes;
use axum::extract::Request;
use axum::{Json, Router};

use crate::agent::AgentApi;
use crate::backend::{Auth, BackendApi, Machine, MachineLogInput, Operator};
use crate::error::{CoreError, Result};
use crate::store::{MachineRepository, OperatorRecord};

/// One request captured by an [`HttpFixture`].
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub authorization: String,
    pub body: serde_json::Value,
}

/// Tiny HTTP server answering every request with one canned JSON body.
pub struct HttpFixture {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl HttpFixture {
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

async fn spawn_fixture(response: serde_json::Value) -> HttpFixture {
    let seen: Arc<Mutex<Vec<SeenRequest>>> = Arc::default();
    let captured = Arc::clone(&seen);

    let app = Router::new().fallback(move |req: Request| {
        let captured = Arc::clone(&captured);
        let response = response.clone();
        async move {
            let (parts, body) = req.into_parts();
            let bytes = to_bytes(body, usize::MAX).await.unwrap_or_default();
            captured.lock().unwrap().push(SeenRequest {
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
                authorization: parts
                    .headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string(),
                body: serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null),
            });
            Json(response)
        }
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    HttpFixture { addr, seen }
}

/// Server playing the authorization service.
pub async fn graphql_fixture(response: serde_json::Value) -> HttpFixture {
    spawn_fixture(response).await
}

/// Server playing a remote agent.
pub async fn agent_fixture(response: serde_json::Value) -> HttpFixture {
    spawn_fixture(response).await
}

/// Scriptable in-memory authorization service.
pub struct FakeBackend {
    pub auth_response: Mutex<Auth>,
    pub operator: Operator,
    pub machines: Mutex<Vec<Machine>>,
    pub token: Mutex<Option<String>>,
    pub logs: Mutex<Vec<MachineLogInput>>,
}

impl FakeBackend {
    pub fn new(operator: Operator, machines: Vec<Machine>) -> Self {
        Self {
            auth_response: Mutex::new(Auth {
                success: true,
                token: "jwt-token".to_string(),
                message: "ok".to_string(),
            }),
            operator,
            machines: Mutex::new(machines),
            token: Mutex::new(None),
            logs: Mutex::new(Vec::new()),
        }
    }

    pub fn set_machines(&self, machines: Vec<Machine>) {
        *self.machines.lock().unwrap() = machines;
    }

    pub fn deny(&self, message: &str) {
        *self.auth_response.lock().unwrap() = Auth {
            success: false,
            token: String::new(),
            message: message.to_string(),
        };
    }
}

#[async_trait]
impl BackendApi for FakeBackend {
    async fn auth(&self, _email: &str, _password: &str, _deadline: Duration) -> Result<Auth> {
        Ok(self.auth_response.lock().unwrap().clone())
    }

    fn set_token(&self, token: &str) {
        *self.token.lock().unwrap() = Some(token.to_string());
    }

    async fn me(&self, _deadline: Duration) -> Result<Operator> {
        Ok(self.operator.clone())
    }

    async fn machines(&self, _deadline: Duration) -> Result<Vec<Machine>> {
        Ok(self.machines.lock().unwrap().clone())
    }

    async fn add_machine_log(&self, batch: &[MachineLogInput], _deadline: Duration) -> Result<()> {
        self.logs.lock().unwrap().extend_from_slice(batch);
        Ok(())
    }
}

/// One grant or revoke observed by [`FakeAgent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCall {
    pub action: &'static str,
    pub endpoint: String,
    pub operator_id: String,
    pub key: String,
}

/// Agent double recording every call; flips to failing when `fail` is set.
#[derive(Default)]
pub struct FakeAgent {
    pub calls: Mutex<Vec<AgentCall>>,
    pub fail: AtomicBool,
}

impl FakeAgent {
    fn record(&self, action: &'static str, endpoint: &str, operator_id: &str, key: &str) -> Result<()> {
        self.calls.lock().unwrap().push(AgentCall {
            action,
            endpoint: endpoint.to_string(),
            operator_id: operator_id.to_string(),
            key: key.to_string(),
        });
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoreError::Transport("agent unreachable".to_string()));
        }
        Ok(())
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentApi for FakeAgent {
    async fn add_authorized_key(
        &self,
        endpoint: &str,
        operator_id: &str,
        key: &str,
    ) -> Result<()> {
        self.record("grant", endpoint, operator_id, key)
    }

    async fn delete_authorized_key(
        &self,
        endpoint: &str,
        operator_id: &str,
        key: &str,
    ) -> Result<()> {
        self.record("revoke", endpoint, operator_id, key)
    }
}

/// HashMap-backed [`MachineRepository`].
#[derive(Default)]
pub struct MemoryRepo {
    pub records: Mutex<HashMap<String, OperatorRecord>>,
}

impl MemoryRepo {
    pub fn with_record(record: OperatorRecord) -> Self {
        let repo = Self::default();
        repo.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
        repo
    }

    pub fn record(&self, operator_id: &str) -> Option<OperatorRecord> {
        self.records.lock().unwrap().get(operator_id).cloned()
    }
}

#[async_trait]
impl MachineRepository for MemoryRepo {
    async fn get(&self, operator_id: &str) -> Result<Option<OperatorRecord>> {
        Ok(self.records.lock().unwrap().get(operator_id).cloned())
    }

    async fn upsert(&self, record: OperatorRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
        Ok(())
    }
}
