//! The five shell verbs and their rendering.

use anyhow::{bail, Result};
use gate_core::{Machine, SessionManager, Tunnel};

use crate::messages::Catalog;

/// What the shell loop should do after a command ran.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    /// Return to the login prompt.
    Logout,
    /// Terminate the process.
    Exit,
}

/// Execute one command line. Empty input is a no-op.
pub async fn execute(line: &str, session: &SessionManager, catalog: &Catalog) -> Result<Outcome> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(Outcome::Continue);
    };

    match verb {
        "me" => {
            me(session, catalog);
            Ok(Outcome::Continue)
        }
        "list" => {
            list(session, catalog);
            Ok(Outcome::Continue)
        }
        "connect" => {
            let Some(name) = words.next() else {
                bail!("usage: connect <machine-name>");
            };
            connect(session, name).await?;
            Ok(Outcome::Continue)
        }
        "logout" => {
            session.sign_out().await;
            Ok(Outcome::Logout)
        }
        "exit" => {
            session.sign_out().await;
            Ok(Outcome::Exit)
        }
        "help" => {
            help(catalog);
            Ok(Outcome::Continue)
        }
        other => bail!("unknown command: {other}"),
    }
}

fn me(session: &SessionManager, catalog: &Catalog) {
    let operator = session.operator();
    let table = render_table(
        &[
            catalog.text("Email"),
            catalog.text("Firstname"),
            catalog.text("Lastname"),
            catalog.text("Job"),
        ],
        &[vec![
            operator.email.clone(),
            operator.first_name.clone(),
            operator.last_name.clone(),
            operator.job.clone(),
        ]],
    );
    println!("{table}{}", catalog.text("MeCaption"));
    session.audit().scoped(&operator.id).info("viewed profile");
}

fn list(session: &SessionManager, catalog: &Catalog) {
    let operator = session.operator();
    let machines = session.machines();
    let rows: Vec<Vec<String>> = machines
        .iter()
        .map(|m| {
            vec![
                m.id.clone(),
                m.name.clone(),
                m.ip.clone(),
                m.agent_port.to_string(),
            ]
        })
        .collect();
    let table = render_table(
        &[
            catalog.text("ID"),
            catalog.text("Name"),
            catalog.text("IP"),
            catalog.text("AgentPort"),
        ],
        &rows,
    );
    println!("{table}{}", catalog.text("ListCaption"));
    session
        .audit()
        .scoped(&operator.id)
        .info(format!("listed {} accessible machine(s)", machines.len()));
}

fn resolve<'a>(machines: &'a [Machine], name: &str) -> Option<&'a Machine> {
    machines.iter().find(|m| m.name == name)
}

async fn connect(session: &SessionManager, name: &str) -> Result<()> {
    // Resolution happens before any dialing; an unknown name never
    // touches the network.
    let machines = session.machines();
    let Some(machine) = resolve(&machines, name) else {
        bail!("{name} is not part of accessible machines");
    };

    let tunnel = Tunnel {
        machine: machine.clone(),
        operator_id: session.operator().id,
        ssh_user: session.ssh_user().to_string(),
        private_key_path: session.private_key_path(),
        audit: session.audit().clone(),
    };
    let status = tunnel.run().await?;
    if status != 0 {
        println!("remote shell exited with status {status}");
    }
    Ok(())
}

fn help(catalog: &Catalog) {
    println!("me        {}", catalog.text("MeShortDesc"));
    println!("list      {}", catalog.text("ListShortDesc"));
    println!("connect   {}", catalog.text("ConnectShortDesc"));
    println!("logout    {}", catalog.text("LogoutShortDesc"));
    println!("exit      {}", catalog.text("ExitShortDesc"));
}

/// Render rows under headers with space-aligned columns.
fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(String::len).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if cell.len() > widths[i] {
                widths[i] = cell.len();
            }
        }
    }

    let mut out = String::new();
    let render_row = |cells: &[String], out: &mut String| {
        for (i, cell) in cells.iter().enumerate() {
            out.push_str(&format!("{:<width$}  ", cell, width = widths[i]));
        }
        while out.ends_with(' ') {
            out.pop();
        }
        out.push('\n');
    };

    render_row(headers, &mut out);
    let rule: usize = widths.iter().map(|w| w + 2).sum::<usize>().saturating_sub(2);
    out.push_str(&"-".repeat(rule));
    out.push('\n');
    for row in rows {
        render_row(row, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_matches_machines_by_name() {
        let machines = vec![
            Machine {
                id: "m1".into(),
                name: "alpha".into(),
                ip: "10.0.0.1".into(),
                agent_port: 3000,
            },
            Machine {
                id: "m2".into(),
                name: "beta".into(),
                ip: "10.0.0.2".into(),
                agent_port: 3000,
            },
        ];
        assert_eq!(resolve(&machines, "beta").unwrap().id, "m2");
        assert!(resolve(&machines, "gamma").is_none());
    }

    #[test]
    fn table_columns_align_to_the_widest_cell() {
        let table = render_table(
            &["ID".to_string(), "Name".to_string()],
            &[
                vec!["m1".to_string(), "alpha".to_string()],
                vec!["machine-2".to_string(), "b".to_string()],
            ],
        );
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "ID         Name");
        assert_eq!(lines[2], "m1         alpha");
        assert_eq!(lines[3], "machine-2  b");
    }

    #[test]
    fn empty_inventory_renders_headers_only() {
        let table = render_table(&["ID".to_string()], &[]);
        assert_eq!(table.lines().count(), 2);
    }
}
