//! Session lifecycle: login, convergence, background polling, logout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::agent::AgentApi;
use crate::audit::AuditLog;
use crate::backend::{BackendApi, Machine, Operator};
use crate::error::{CoreError, Result};
use crate::keystore::KeyStore;
use crate::poller::{spawn_poller, JobReport, PollJob};
use crate::reconcile::Reconciler;
use crate::state::SessionState;
use crate::store::{MachineRepository, OperatorRecord};

/// Deadline for the authentication call.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for the periodic refresh calls.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(15);
/// Cadence of the background refresh.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

struct ActivePoll {
    stop: watch::Sender<bool>,
    poller: JoinHandle<()>,
    drain: JoinHandle<()>,
}

struct SessionCore {
    ssh_user: String,
    backend: Arc<dyn BackendApi>,
    repo: Arc<dyn MachineRepository>,
    keystore: KeyStore,
    state: SessionState,
    audit: AuditLog,
    reconciler: Reconciler,
}

impl SessionCore {
    async fn refresh_operator(&self, deadline: Duration) -> Result<()> {
        let operator = self.backend.me(deadline).await?;
        self.state.set_operator(operator);
        Ok(())
    }

    async fn refresh_machines(&self, deadline: Duration) -> Result<()> {
        let machines = self.backend.machines(deadline).await?;
        self.state.set_machines(machines);
        Ok(())
    }

    /// One reconciliation pass over a single inventory snapshot. A
    /// refresh that lands mid-pass is only visible to the next pass.
    async fn reconcile_once(&self) -> Result<()> {
        let operator = self.state.operator();
        let key = self.state.public_key();
        let snapshot = self.state.machines();
        self.reconciler.run(&operator.id, &key, &snapshot).await
    }
}

/// Orchestrates the operator's session. Exactly one operator is logged in
/// per process; a second `sign_up` without a `sign_out` is a caller bug
/// and is rejected.
pub struct SessionManager {
    core: Arc<SessionCore>,
    poll: Mutex<Option<ActivePoll>>,
}

impl SessionManager {
    pub fn new(
        ssh_user: impl Into<String>,
        backend: Arc<dyn BackendApi>,
        agents: Arc<dyn AgentApi>,
        repo: Arc<dyn MachineRepository>,
        keystore: KeyStore,
        audit: AuditLog,
    ) -> Self {
        let reconciler = Reconciler::new(agents, Arc::clone(&repo), audit.clone());
        Self {
            core: Arc::new(SessionCore {
                ssh_user: ssh_user.into(),
                backend,
                repo,
                keystore,
                state: SessionState::new(),
                audit,
                reconciler,
            }),
            poll: Mutex::new(None),
        }
    }

    /// Authenticate the operator and bring the session to its ready
    /// state: identity and inventory fetched, key material ensured, one
    /// synchronous reconciliation done, background polling started.
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<()> {
        let mut poll = self.poll.lock().await;
        if poll.is_some() {
            return Err(CoreError::AuthDenied(
                "an operator is already logged in".to_string(),
            ));
        }

        let result = self.initialize(&mut poll, email, password).await;
        if result.is_err() {
            // A half-initialized session must not leak into the next
            // login attempt.
            self.core.state.reset();
        }
        result
    }

    async fn initialize(
        &self,
        poll: &mut Option<ActivePoll>,
        email: &str,
        password: &str,
    ) -> Result<()> {
        let core = &self.core;
        let auth = core.backend.auth(email, password, LOGIN_TIMEOUT).await?;
        if !auth.success {
            return Err(CoreError::AuthDenied(auth.message));
        }
        core.backend.set_token(&auth.token);

        core.refresh_operator(REFRESH_TIMEOUT).await?;
        let operator = core.state.operator();

        // Seed the store on the operator's first login only. An existing
        // record is the revoke side of the upcoming reconciliation and
        // must survive the login untouched.
        if core.repo.get(&operator.id).await?.is_none() {
            core.repo
                .upsert(OperatorRecord {
                    id: operator.id.clone(),
                    machines: Vec::new(),
                })
                .await?;
        }

        core.refresh_machines(REFRESH_TIMEOUT).await?;

        let material = core.keystore.ensure(&operator.id)?;
        core.state.set_public_key(&material.public_key);

        core.reconcile_once().await?;

        *poll = Some(self.start_polling(&operator));
        core.state.set_logged_in(true);

        core.audit.scoped(&operator.id).info(format!(
            "operator {} {} logged in",
            operator.first_name, operator.last_name
        ));
        Ok(())
    }

    fn start_polling(&self, operator: &Operator) -> ActivePoll {
        let jobs = vec![
            job("refresh-operator", &self.core, |core, deadline| async move {
                core.refresh_operator(deadline).await
            }),
            job("refresh-machines", &self.core, |core, deadline| async move {
                core.refresh_machines(deadline).await
            }),
            job("reconcile", &self.core, |core, _deadline| async move {
                core.reconcile_once().await
            }),
        ];

        let (stop_tx, stop_rx) = watch::channel(false);
        let (report_tx, mut report_rx) = mpsc::channel::<JobReport>(jobs.len());
        let poller = spawn_poller(POLL_INTERVAL, jobs, report_tx, stop_rx);

        let audit = self.core.audit.clone();
        let operator_id = operator.id.clone();
        let drain = tokio::spawn(async move {
            // Runs until the report channel closes, which happens once
            // the poller has stopped and every in-flight job is done.
            while let Some(report) = report_rx.recv().await {
                if let Err(err) = report.result {
                    audit.scoped(&operator_id).warn(format!(
                        "{} failed: {err}; the server may be unreachable",
                        report.job
                    ));
                }
            }
        });

        ActivePoll {
            stop: stop_tx,
            poller,
            drain,
        }
    }

    /// Sign the operator out: stop future ticks, wait for the drain to
    /// quiesce, and zero the session state.
    pub async fn sign_out(&self) {
        let operator = self.core.state.operator();
        self.core.audit.scoped(&operator.id).info(format!(
            "operator {} {} logged out",
            operator.first_name, operator.last_name
        ));

        self.core.state.set_logged_in(false);

        if let Some(active) = self.poll.lock().await.take() {
            let _ = active.stop.send(true);
            let _ = active.poller.await;
            let _ = active.drain.await;
        }

        self.core.state.reset();
    }

    pub fn operator(&self) -> Operator {
        self.core.state.operator()
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.core.state.machines()
    }

    pub fn logged_in(&self) -> bool {
        self.core.state.logged_in()
    }

    pub fn public_key(&self) -> String {
        self.core.state.public_key()
    }

    pub fn ssh_user(&self) -> &str {
        &self.core.ssh_user
    }

    /// Path of the logged-in operator's private key.
    pub fn private_key_path(&self) -> std::path::PathBuf {
        self.core
            .keystore
            .private_key_path(&self.core.state.operator().id)
    }

    pub fn audit(&self) -> &AuditLog {
        &self.core.audit
    }
}

fn job<F, Fut>(name: &'static str, core: &Arc<SessionCore>, run: F) -> PollJob
where
    F: Fn(Arc<SessionCore>, Duration) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let core = Arc::clone(core);
    PollJob::new(name, move |deadline| {
        Box::pin(run(Arc::clone(&core), deadline))
    })
}
