//! Secure Gate interactive bastion shell.

mod commands;
mod messages;
mod prompt;
mod shell;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gate_core::{
    AgentClient, AuditLog, BackendClient, Configuration, KeyStore, SessionManager, SqliteStore,
};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::messages::Catalog;
use crate::shell::Shell;

#[derive(Parser)]
#[command(name = "gate", about = "Secure Gate bastion shell", version)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "gate=info,gate_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cfg = Configuration::from_file(&cli.config)
        .with_context(|| format!("could not load {}", cli.config.display()))?;
    debug!(
        ssh_user = %cfg.ssh_user,
        backend_uri = %cfg.backend_uri,
        language = %cfg.language,
        db_path = %cfg.db_path.display(),
        log_path = %cfg.log_path.display(),
        "configuration loaded"
    );

    let backend = Arc::new(BackendClient::new(cfg.backend_uri.clone()));
    let agents = Arc::new(AgentClient::new(cfg.agent_authentication_token.clone()));
    let store = Arc::new(
        SqliteStore::open(&cfg.db_path)
            .with_context(|| format!("could not open store in {}", cfg.db_path.display()))?,
    );
    let audit = AuditLog::open(&cfg.log_path).with_shipper(Arc::clone(&backend) as _);

    let session = SessionManager::new(
        cfg.ssh_user.clone(),
        Arc::clone(&backend) as _,
        agents,
        store,
        KeyStore::in_home(),
        audit,
    );

    Shell::new(session, Catalog::new(&cfg.language)).run().await
}
