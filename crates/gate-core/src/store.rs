//! Persistent map of operator id to the last reconciled machine list.
//!
//! The store is only ever read as the *previous* side of a reconciliation
//! diff and rewritten wholesale after each pass. Records are kept as JSON
//! in a single `users` table.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::backend::Machine;
use crate::error::{CoreError, Result};

const DATABASE_FILE: &str = "securegate.db";

/// Network coordinates of a machine as last reconciled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default, rename = "agentPort")]
    pub agent_port: u16,
}

impl From<&Machine> for MachineRecord {
    fn from(m: &Machine) -> Self {
        Self {
            id: m.id.clone(),
            name: m.name.clone(),
            ip: m.ip.clone(),
            agent_port: m.agent_port,
        }
    }
}

/// Per-operator store entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorRecord {
    pub id: String,
    #[serde(default)]
    pub machines: Vec<MachineRecord>,
}

/// Storage contract used by the reconciler and the session manager.
#[async_trait]
pub trait MachineRepository: Send + Sync {
    async fn get(&self, operator_id: &str) -> Result<Option<OperatorRecord>>;
    async fn upsert(&self, record: OperatorRecord) -> Result<()>;
}

/// SQLite-backed [`MachineRepository`].
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open (or create) the store under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            CoreError::Persistence(format!("could not create {}: {e}", dir.display()))
        })?;
        let conn = rusqlite::Connection::open(dir.join(DATABASE_FILE))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id     TEXT PRIMARY KEY,
                record TEXT NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl MachineRepository for SqliteStore {
    async fn get(&self, operator_id: &str) -> Result<Option<OperatorRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT record FROM users WHERE id = ?1")?;
        let mut rows = stmt.query([operator_id])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                let record = serde_json::from_str(&raw)
                    .map_err(|e| CoreError::Persistence(format!("corrupt record: {e}")))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn upsert(&self, record: OperatorRecord) -> Result<()> {
        let raw = serde_json::to_string(&record)
            .map_err(|e| CoreError::Persistence(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (id, record) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET record = excluded.record",
            rusqlite::params![record.id, raw],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, machines: Vec<MachineRecord>) -> OperatorRecord {
        OperatorRecord {
            id: id.to_string(),
            machines,
        }
    }

    #[tokio::test]
    async fn missing_operator_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        assert!(store.get("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();

        let rec = record(
            "u1",
            vec![MachineRecord {
                id: "m1".into(),
                name: "alpha".into(),
                ip: "10.0.0.1".into(),
                agent_port: 3000,
            }],
        );
        store.upsert(rec.clone()).await.unwrap();
        assert_eq!(store.get("u1").await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn upsert_replaces_the_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();

        store
            .upsert(record(
                "u1",
                vec![MachineRecord {
                    id: "m1".into(),
                    ..Default::default()
                }],
            ))
            .await
            .unwrap();
        store.upsert(record("u1", Vec::new())).await.unwrap();

        let got = store.get("u1").await.unwrap().unwrap();
        assert!(got.machines.is_empty());
    }

    #[tokio::test]
    async fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SqliteStore::open(dir.path()).unwrap();
            store.upsert(record("u1", Vec::new())).await.unwrap();
        }
        let store = SqliteStore::open(dir.path()).unwrap();
        assert!(store.get("u1").await.unwrap().is_some());
    }
}
