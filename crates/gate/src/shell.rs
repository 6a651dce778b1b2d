//! Interactive shell: a login loop wrapping a command loop.

use anyhow::Result;
use gate_core::SessionManager;
use tracing::error;

use crate::commands::{self, Outcome};
use crate::messages::Catalog;
use crate::prompt;

pub struct Shell {
    session: SessionManager,
    catalog: Catalog,
}

impl Shell {
    pub fn new(session: SessionManager, catalog: Catalog) -> Self {
        Self { session, catalog }
    }

    /// Run until the operator exits or input ends.
    pub async fn run(&self) -> Result<()> {
        loop {
            // Authenticate until it succeeds.
            let Some(email) = prompt::read_line("Email: ")? else {
                return Ok(());
            };
            let Some(password) = prompt::read_password("Password: ")? else {
                return Ok(());
            };

            if let Err(err) = self.session.sign_up(&email, &password).await {
                error!("{err}");
                continue;
            }

            let operator = self.session.operator();
            println!(
                "{}",
                self.catalog
                    .greeting("Hello", &operator.first_name, &operator.last_name)
            );

            if !self.command_loop().await? {
                println!(
                    "{}",
                    self.catalog
                        .greeting("Goodbye", &operator.first_name, &operator.last_name)
                );
                return Ok(());
            }
            println!(
                "{}",
                self.catalog
                    .greeting("Goodbye", &operator.first_name, &operator.last_name)
            );
        }
    }

    /// Execute commands until logout. Returns false when the process
    /// should terminate instead of re-prompting for credentials.
    async fn command_loop(&self) -> Result<bool> {
        let shell_prompt = prompt::shell_prompt();
        while self.session.logged_in() {
            let Some(line) = prompt::read_line(&shell_prompt)? else {
                // End of input signs the operator out.
                self.session.sign_out().await;
                return Ok(false);
            };
            if line.trim().is_empty() {
                continue;
            }

            // Every accepted line lands in the audit trail.
            let operator = self.session.operator();
            self.session.audit().scoped(&operator.id).warn(&line);

            match commands::execute(&line, &self.session, &self.catalog).await {
                Ok(Outcome::Continue) => {}
                Ok(Outcome::Logout) => return Ok(true),
                Ok(Outcome::Exit) => return Ok(false),
                Err(err) => {
                    self.session
                        .audit()
                        .scoped(&operator.id)
                        .error(err.to_string());
                }
            }
        }
        Ok(true)
    }
}
