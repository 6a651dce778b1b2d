//! Convergence of remote agents with the operator's current permissions.
//!
//! Each pass diffs the last committed machine list against a fresh
//! inventory snapshot, revokes the operator's key on machines that
//! disappeared and installs it on machines that appeared, then commits
//! the fresh inventory. Membership is by machine id only: a machine whose
//! ip or port changed keeps its key and simply gets new coordinates in
//! the committed record.

use std::collections::HashMap;
use std::sync::Arc;

use crate::agent::AgentApi;
use crate::audit::AuditLog;
use crate::backend::Machine;
use crate::error::Result;
use crate::store::{MachineRecord, MachineRepository, OperatorRecord};

/// Base URL of the agent on a machine.
pub fn agent_endpoint(ip: &str, port: u16) -> String {
    format!("http://{ip}:{port}")
}

/// Issues paired grant/revoke calls and commits the result.
pub struct Reconciler {
    agents: Arc<dyn AgentApi>,
    repo: Arc<dyn MachineRepository>,
    audit: AuditLog,
}

impl Reconciler {
    pub fn new(
        agents: Arc<dyn AgentApi>,
        repo: Arc<dyn MachineRepository>,
        audit: AuditLog,
    ) -> Self {
        Self {
            agents,
            repo,
            audit,
        }
    }

    /// Run one pass against the given inventory snapshot.
    ///
    /// Individual agent failures are logged and do not abort the pass;
    /// the fresh inventory is committed regardless, and the next tick
    /// retries whatever still differs. Store failures do abort.
    pub async fn run(&self, operator_id: &str, public_key: &str, next: &[Machine]) -> Result<()> {
        let prev = self
            .repo
            .get(operator_id)
            .await?
            .map(|r| r.machines)
            .unwrap_or_default();

        let prev_ids: HashMap<&str, &MachineRecord> =
            prev.iter().map(|m| (m.id.as_str(), m)).collect();
        let next_ids: HashMap<&str, &Machine> =
            next.iter().map(|m| (m.id.as_str(), m)).collect();
        let scope = self.audit.scoped(operator_id);

        // Machines the operator lost: revoke at the coordinates we last
        // knew, since the fresh inventory no longer carries them.
        for machine in prev.iter().filter(|m| !next_ids.contains_key(m.id.as_str())) {
            let endpoint = agent_endpoint(&machine.ip, machine.agent_port);
            if let Err(err) = self
                .agents
                .delete_authorized_key(&endpoint, operator_id, public_key)
                .await
            {
                scope.warn(format!(
                    "could not unregister key on {}: {err}",
                    machine.name
                ));
            }
        }

        // Machines the operator gained.
        for machine in next.iter().filter(|m| !prev_ids.contains_key(m.id.as_str())) {
            let endpoint = agent_endpoint(&machine.ip, machine.agent_port);
            if let Err(err) = self
                .agents
                .add_authorized_key(&endpoint, operator_id, public_key)
                .await
            {
                scope.warn(format!("could not register key on {}: {err}", machine.name));
            }
        }

        self.repo
            .upsert(OperatorRecord {
                id: operator_id.to_string(),
                machines: next.iter().map(MachineRecord::from).collect(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeAgent, MemoryRepo};
    use std::sync::atomic::Ordering;

    const KEY: &str = "ssh-rsa AAAA test-key";

    fn machine(id: &str, ip: &str, port: u16) -> Machine {
        Machine {
            id: id.to_string(),
            name: format!("name-{id}"),
            ip: ip.to_string(),
            agent_port: port,
        }
    }

    fn record_of(machines: &[Machine]) -> Vec<MachineRecord> {
        machines.iter().map(MachineRecord::from).collect()
    }

    fn reconciler(agent: &Arc<FakeAgent>, repo: &Arc<MemoryRepo>) -> Reconciler {
        let dir = tempfile::tempdir().unwrap();
        Reconciler::new(
            Arc::clone(agent) as Arc<dyn AgentApi>,
            Arc::clone(repo) as Arc<dyn MachineRepository>,
            AuditLog::open(dir.path().join("audit.log")),
        )
    }

    #[tokio::test]
    async fn first_login_with_empty_inventory_makes_no_calls() {
        let agent = Arc::new(FakeAgent::default());
        let repo = Arc::new(MemoryRepo::with_record(OperatorRecord {
            id: "u1".into(),
            machines: Vec::new(),
        }));

        reconciler(&agent, &repo).run("u1", KEY, &[]).await.unwrap();

        assert!(agent.calls().is_empty());
        assert_eq!(repo.record("u1").unwrap().machines, Vec::new());
    }

    #[tokio::test]
    async fn new_machine_gets_exactly_one_grant() {
        let m1 = machine("m1", "10.0.0.1", 3000);
        let m2 = machine("m2", "10.0.0.2", 3000);
        let agent = Arc::new(FakeAgent::default());
        let repo = Arc::new(MemoryRepo::with_record(OperatorRecord {
            id: "u1".into(),
            machines: record_of(std::slice::from_ref(&m1)),
        }));

        reconciler(&agent, &repo)
            .run("u1", KEY, &[m1.clone(), m2.clone()])
            .await
            .unwrap();

        let calls = agent.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, "grant");
        assert_eq!(calls[0].endpoint, "http://10.0.0.2:3000");
        assert_eq!(calls[0].operator_id, "u1");
        assert_eq!(calls[0].key, KEY);
        assert_eq!(repo.record("u1").unwrap().machines, record_of(&[m1, m2]));
    }

    #[tokio::test]
    async fn removed_machine_gets_a_revoke_at_its_old_coordinates() {
        let m1 = machine("m1", "10.0.0.1", 3000);
        let agent = Arc::new(FakeAgent::default());
        let repo = Arc::new(MemoryRepo::with_record(OperatorRecord {
            id: "u1".into(),
            machines: record_of(std::slice::from_ref(&m1)),
        }));

        reconciler(&agent, &repo).run("u1", KEY, &[]).await.unwrap();

        let calls = agent.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, "revoke");
        assert_eq!(calls[0].endpoint, "http://10.0.0.1:3000");
        assert!(repo.record("u1").unwrap().machines.is_empty());
    }

    #[tokio::test]
    async fn coordinate_drift_is_not_a_permission_change() {
        let before = machine("m1", "10.0.0.1", 3000);
        let after = machine("m1", "10.9.9.9", 4000);
        let agent = Arc::new(FakeAgent::default());
        let repo = Arc::new(MemoryRepo::with_record(OperatorRecord {
            id: "u1".into(),
            machines: record_of(std::slice::from_ref(&before)),
        }));

        reconciler(&agent, &repo)
            .run("u1", KEY, std::slice::from_ref(&after))
            .await
            .unwrap();

        assert!(agent.calls().is_empty());
        // The new coordinates still overwrite the record.
        assert_eq!(repo.record("u1").unwrap().machines, record_of(&[after]));
    }

    #[tokio::test]
    async fn unrelated_machines_receive_no_calls() {
        let kept = machine("m1", "10.0.0.1", 3000);
        let lost = machine("m2", "10.0.0.2", 3000);
        let gained = machine("m3", "10.0.0.3", 3000);
        let agent = Arc::new(FakeAgent::default());
        let repo = Arc::new(MemoryRepo::with_record(OperatorRecord {
            id: "u1".into(),
            machines: record_of(&[kept.clone(), lost.clone()]),
        }));

        reconciler(&agent, &repo)
            .run("u1", KEY, &[kept.clone(), gained.clone()])
            .await
            .unwrap();

        let calls = agent.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls
            .iter()
            .any(|c| c.action == "revoke" && c.endpoint == "http://10.0.0.2:3000"));
        assert!(calls
            .iter()
            .any(|c| c.action == "grant" && c.endpoint == "http://10.0.0.3:3000"));
        assert!(!calls.iter().any(|c| c.endpoint == "http://10.0.0.1:3000"));
    }

    #[tokio::test]
    async fn agent_failure_does_not_abort_the_pass_or_the_commit() {
        let m1 = machine("m1", "10.0.0.1", 3000);
        let agent = Arc::new(FakeAgent::default());
        agent.fail.store(true, Ordering::SeqCst);
        let repo = Arc::new(MemoryRepo::default());

        reconciler(&agent, &repo)
            .run("u1", KEY, std::slice::from_ref(&m1))
            .await
            .unwrap();

        // The grant was attempted, failed, and the inventory was still
        // committed; the diff is now empty so the next pass is quiet.
        assert_eq!(agent.calls().len(), 1);
        assert_eq!(repo.record("u1").unwrap().machines, record_of(&[m1.clone()]));

        agent.fail.store(false, Ordering::SeqCst);
        reconciler(&agent, &repo)
            .run("u1", KEY, std::slice::from_ref(&m1))
            .await
            .unwrap();
        assert_eq!(agent.calls().len(), 1);
    }

    #[tokio::test]
    async fn eventual_convergence_once_agents_recover() {
        let m1 = machine("m1", "10.0.0.1", 3000);
        let m2 = machine("m2", "10.0.0.2", 3000);
        let agent = Arc::new(FakeAgent::default());
        let repo = Arc::new(MemoryRepo::default());
        let rec = reconciler(&agent, &repo);

        // Inventory stabilizes at {m1, m2}; run several ticks.
        for _ in 0..3 {
            rec.run("u1", KEY, &[m1.clone(), m2.clone()]).await.unwrap();
        }
        rec.run("u1", KEY, std::slice::from_ref(&m1)).await.unwrap();
        for _ in 0..3 {
            rec.run("u1", KEY, std::slice::from_ref(&m1)).await.unwrap();
        }

        let calls = agent.calls();
        let grants_m2 = calls
            .iter()
            .filter(|c| c.action == "grant" && c.endpoint == "http://10.0.0.2:3000")
            .count();
        let revokes_m2 = calls
            .iter()
            .filter(|c| c.action == "revoke" && c.endpoint == "http://10.0.0.2:3000")
            .count();
        // m2 saw exactly one grant while present and one final revoke.
        assert_eq!(grants_m2, 1);
        assert_eq!(revokes_m2, 1);

        let grants_m1 = calls
            .iter()
            .filter(|c| c.action == "grant" && c.endpoint == "http://10.0.0.1:3000")
            .count();
        assert_eq!(grants_m1, 1);
    }
}
