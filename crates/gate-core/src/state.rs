//! In-memory snapshot of the logged-in operator's session.
//!
//! Readers and writers live on different tasks: the poller rewrites the
//! operator and the inventory every tick while the shell reads them for
//! prompts and commands. Each field sits behind its own lock and the
//! accessors copy values out, so a reader never observes a half-written
//! inventory and never blocks a writer for longer than a clone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::backend::{Machine, Operator};

/// Shared mutable session state. All accessors are synchronous and hold
/// their lock only for the duration of a copy.
#[derive(Default)]
pub struct SessionState {
    operator: RwLock<Operator>,
    machines: RwLock<Vec<Machine>>,
    public_key: RwLock<String>,
    logged_in: AtomicBool,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operator(&self) -> Operator {
        self.operator.read().expect("operator lock poisoned").clone()
    }

    pub fn set_operator(&self, operator: Operator) {
        *self.operator.write().expect("operator lock poisoned") = operator;
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.machines.read().expect("machines lock poisoned").clone()
    }

    pub fn set_machines(&self, machines: Vec<Machine>) {
        *self.machines.write().expect("machines lock poisoned") = machines;
    }

    pub fn public_key(&self) -> String {
        self.public_key
            .read()
            .expect("public key lock poisoned")
            .clone()
    }

    pub fn set_public_key(&self, key: &str) {
        *self.public_key.write().expect("public key lock poisoned") = key.to_string();
    }

    pub fn logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    pub fn set_logged_in(&self, value: bool) {
        self.logged_in.store(value, Ordering::SeqCst);
    }

    /// Restore every field to its zero value.
    pub fn reset(&self) {
        self.set_logged_in(false);
        self.set_operator(Operator::default());
        self.set_machines(Vec::new());
        self.set_public_key("");
    }
}
