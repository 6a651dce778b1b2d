//! Structured audit sink.
//!
//! Every record carries the operator id; tunnel records additionally
//! carry the machine id. Records are appended as JSON lines to the audit
//! file and echoed through `tracing`. Records with a machine id are also
//! queued to a background shipper that forwards them to the authorization
//! service as `addMachineLog` batches. Rotation and cross-process locking
//! of the file are handled outside this process.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::backend::{BackendApi, MachineLogInput};

const SHIP_TIMEOUT: Duration = Duration::from_secs(15);
const SHIP_BATCH_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warn => "warning",
            Level::Error => "error",
        }
    }
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    time: String,
    level: &'static str,
    user: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    machine: Option<&'a str>,
    msg: &'a str,
}

struct AuditInner {
    file: Mutex<Option<File>>,
    shipper: Option<mpsc::UnboundedSender<MachineLogInput>>,
}

/// Handle to the audit sink; cheap to clone.
#[derive(Clone)]
pub struct AuditLog {
    inner: Arc<AuditInner>,
}

impl AuditLog {
    /// Open the audit file in append mode, creating parent directories.
    /// A file that cannot be opened downgrades the sink to tracing-only.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = open_append(&path);
        if file.is_none() {
            warn!(path = %path.display(), "audit file not writable, records go to tracing only");
        }
        Self {
            inner: Arc::new(AuditInner {
                file: Mutex::new(file),
                shipper: None,
            }),
        }
    }

    /// Forward machine-scoped records to the authorization service.
    pub fn with_shipper(self, backend: Arc<dyn BackendApi>) -> Self {
        let file = self
            .inner
            .file
            .lock()
            .expect("audit file lock poisoned")
            .take();
        Self {
            inner: Arc::new(AuditInner {
                file: Mutex::new(file),
                shipper: Some(spawn_shipper(backend)),
            }),
        }
    }

    /// Records scoped to an operator.
    pub fn scoped(&self, user: &str) -> AuditScope {
        AuditScope {
            log: self.clone(),
            user: user.to_string(),
            machine: None,
        }
    }

    /// Records scoped to an operator and the machine they are tunneled to.
    pub fn machine_scoped(&self, user: &str, machine: &str) -> AuditScope {
        AuditScope {
            log: self.clone(),
            user: user.to_string(),
            machine: Some(machine.to_string()),
        }
    }

    fn emit(&self, level: Level, user: &str, machine: Option<&str>, msg: &str) {
        let record = AuditRecord {
            time: Utc::now().to_rfc3339(),
            level: level.as_str(),
            user,
            machine,
            msg,
        };
        if let Ok(line) = serde_json::to_string(&record) {
            let mut file = self.inner.file.lock().expect("audit file lock poisoned");
            if let Some(f) = file.as_mut() {
                let _ = writeln!(f, "{line}");
            }
        }

        match level {
            Level::Info => info!(user, machine, "{msg}"),
            Level::Warn => warn!(user, machine, "{msg}"),
            Level::Error => error!(user, machine, "{msg}"),
        }

        if let (Some(machine), Some(shipper)) = (machine, self.inner.shipper.as_ref()) {
            let _ = shipper.send(MachineLogInput {
                timestamp: Utc::now().timestamp_millis(),
                machine_id: machine.to_string(),
                user_id: user.to_string(),
                log: msg.to_string(),
            });
        }
    }
}

/// An [`AuditLog`] with its structured fields bound.
pub struct AuditScope {
    log: AuditLog,
    user: String,
    machine: Option<String>,
}

impl AuditScope {
    pub fn info(&self, msg: impl AsRef<str>) {
        self.emit(Level::Info, msg.as_ref());
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        self.emit(Level::Warn, msg.as_ref());
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        self.emit(Level::Error, msg.as_ref());
    }

    fn emit(&self, level: Level, msg: &str) {
        self.log
            .emit(level, &self.user, self.machine.as_deref(), msg);
    }
}

fn open_append(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    OpenOptions::new().create(true).append(true).open(path).ok()
}

fn spawn_shipper(backend: Arc<dyn BackendApi>) -> mpsc::UnboundedSender<MachineLogInput> {
    let (tx, mut rx) = mpsc::unbounded_channel::<MachineLogInput>();
    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while batch.len() < SHIP_BATCH_LIMIT {
                match rx.try_recv() {
                    Ok(record) => batch.push(record),
                    Err(_) => break,
                }
            }
            if let Err(err) = backend.add_machine_log(&batch, SHIP_TIMEOUT).await {
                warn!(error = %err, count = batch.len(), "could not ship machine logs");
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Operator;
    use crate::testutil::FakeBackend;

    #[tokio::test]
    async fn records_land_in_the_file_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.log");
        let audit = AuditLog::open(&path);

        audit.scoped("u1").info("hello");
        audit.machine_scoped("u1", "m1").warn("ls -la");

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["user"], "u1");
        assert_eq!(lines[0]["level"], "info");
        assert!(lines[0].get("machine").is_none());
        assert_eq!(lines[1]["machine"], "m1");
        assert_eq!(lines[1]["msg"], "ls -la");
    }

    #[tokio::test]
    async fn machine_records_are_shipped_to_the_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(Operator::default(), Vec::new()));
        let audit =
            AuditLog::open(dir.path().join("gate.log")).with_shipper(Arc::clone(&backend) as _);

        audit.machine_scoped("u1", "m1").warn("whoami");
        audit.scoped("u1").info("not machine scoped");

        // Give the shipper a moment to drain.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let shipped = backend.logs.lock().unwrap().clone();
        assert_eq!(shipped.len(), 1);
        assert_eq!(shipped[0].machine_id, "m1");
        assert_eq!(shipped[0].user_id, "u1");
        assert_eq!(shipped[0].log, "whoami");
        assert!(shipped[0].timestamp > 0);
    }
}
