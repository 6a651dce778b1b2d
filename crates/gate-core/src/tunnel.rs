//! Audited interactive SSH tunnel to a remote machine.
//!
//! The tunnel dials the machine's agent port, authenticates with the
//! operator's private key only, requests a PTY matching the local
//! terminal and bridges the local terminal with the remote shell. Remote
//! output is duplicated into a line-oriented audit buffer; each completed
//! line becomes a warn-level record carrying the operator and machine
//! ids. The server's host key is accepted blindly: the path between the
//! bastion and its machines is authenticated at another layer.

use std::path::PathBuf;
use std::sync::Arc;

use russh::client;
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Pty};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::audit::AuditLog;
use crate::backend::Machine;
use crate::error::{CoreError, Result};
use crate::keystore;

const TERM: &str = "xterm-256color";
const BAUD: u32 = 115200;

/// Interactive tunnel to one machine.
pub struct Tunnel {
    pub machine: Machine,
    pub operator_id: String,
    pub ssh_user: String,
    pub private_key_path: PathBuf,
    pub audit: AuditLog,
}

struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Restores the local terminal on every exit path, including unwinds.
struct RawModeGuard;

impl RawModeGuard {
    fn enter() -> Result<Self> {
        crossterm::terminal::enable_raw_mode()
            .map_err(|e| CoreError::Terminal(format!("could not enter raw mode: {e}")))?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

impl Tunnel {
    /// Open the tunnel, run the remote shell to completion and return its
    /// exit status.
    pub async fn run(&self) -> Result<u32> {
        let key = keystore::load_private_key(&self.private_key_path)?;

        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(
            config,
            (self.machine.ip.as_str(), self.machine.agent_port),
            AcceptAnyHostKey,
        )
        .await
        .map_err(|e| transport(&self.machine, e))?;

        let rsa_hash = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| transport(&self.machine, e))?
            .flatten();
        let auth = handle
            .authenticate_publickey(
                &self.ssh_user,
                PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash),
            )
            .await
            .map_err(|e| transport(&self.machine, e))?;
        if !auth.success() {
            return Err(CoreError::Transport(format!(
                "{} refused publickey authentication for {}",
                self.machine.name, self.ssh_user
            )));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| transport(&self.machine, e))?;

        let (cols, rows) = crossterm::terminal::size()
            .map_err(|e| CoreError::Terminal(format!("could not query terminal size: {e}")))?;
        let _raw = RawModeGuard::enter()?;

        channel
            .request_pty(
                false,
                TERM,
                u32::from(cols),
                u32::from(rows),
                0,
                0,
                &[
                    (Pty::ECHO, 1),
                    (Pty::ECHOCTL, 0),
                    (Pty::TTY_OP_ISPEED, BAUD),
                    (Pty::TTY_OP_OSPEED, BAUD),
                ],
            )
            .await
            .map_err(|e| transport(&self.machine, e))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| transport(&self.machine, e))?;

        let exit_status = self.bridge(channel).await?;
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
        Ok(exit_status)
    }

    /// Bridge stdin/stdout/stderr with the remote shell until it exits.
    async fn bridge(&self, mut channel: russh::Channel<client::Msg>) -> Result<u32> {
        let scope = self
            .audit
            .machine_scoped(&self.operator_id, &self.machine.id);
        let mut stdout_lines = LineBuffer::new();
        let mut stderr_lines = LineBuffer::new();

        let mut stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        let mut buf = vec![0u8; 4096];
        let mut stdin_open = true;
        let mut exit_status = 0u32;

        loop {
            tokio::select! {
                read = stdin.read(&mut buf), if stdin_open => match read {
                    Ok(0) | Err(_) => {
                        stdin_open = false;
                        let _ = channel.eof().await;
                    }
                    Ok(n) => {
                        channel
                            .data(&buf[..n])
                            .await
                            .map_err(|e| transport(&self.machine, e))?;
                    }
                },
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        stdout
                            .write_all(&data)
                            .await
                            .map_err(|e| CoreError::Terminal(e.to_string()))?;
                        stdout
                            .flush()
                            .await
                            .map_err(|e| CoreError::Terminal(e.to_string()))?;
                        stdout_lines.push(&data, |line| scope.warn(line));
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        stderr
                            .write_all(&data)
                            .await
                            .map_err(|e| CoreError::Terminal(e.to_string()))?;
                        stderr
                            .flush()
                            .await
                            .map_err(|e| CoreError::Terminal(e.to_string()))?;
                        stderr_lines.push(&data, |line| scope.warn(line));
                    }
                    Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                        exit_status = status;
                    }
                    Some(ChannelMsg::Eof) => {}
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
            }
        }

        Ok(exit_status)
    }
}

fn transport(machine: &Machine, err: impl std::fmt::Display) -> CoreError {
    CoreError::Transport(format!("ssh to {} failed: {err}", machine.name))
}

/// Accumulates bytes and emits one record per completed line, newline
/// excluded. A trailing partial line is dropped when the buffer goes
/// away; the audit trail is strictly line-oriented.
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push<F: FnMut(&str)>(&mut self, bytes: &[u8], mut emit: F) {
        self.buf.extend_from_slice(bytes);
        while let Some(i) = self.buf.iter().position(|&b| b == b'\n') {
            {
                let line = &self.buf[..i];
                emit(&String::from_utf8_lossy(line));
            }
            self.buf.drain(..=i);
        }
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunks: &[&[u8]]) -> Vec<String> {
        let mut buffer = LineBuffer::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            buffer.push(chunk, |line| lines.push(line.to_string()));
        }
        lines
    }

    #[test]
    fn one_record_per_newline() {
        let lines = collect(&[b"total 4\ndrwxr-x foo\n"]);
        assert_eq!(lines, vec!["total 4", "drwxr-x foo"]);
    }

    #[test]
    fn lines_split_across_chunks_are_reassembled() {
        let lines = collect(&[b"hel", b"lo wor", b"ld\nnext"]);
        assert_eq!(lines, vec!["hello world"]);
    }

    #[test]
    fn trailing_partial_line_is_not_emitted() {
        let lines = collect(&[b"complete\npartial"]);
        assert_eq!(lines, vec!["complete"]);
    }

    #[test]
    fn emitted_lines_reassemble_the_prefix_of_the_stream() {
        let stream: &[u8] = b"a\nbb\nccc\ntail";
        let lines = collect(&[stream]);
        let reassembled = lines.join("\n") + "\n";
        assert_eq!(reassembled.as_bytes(), &stream[..stream.len() - 4]);
    }

    #[test]
    fn empty_lines_are_preserved() {
        let lines = collect(&[b"\n\nx\n"]);
        assert_eq!(lines, vec!["", "", "x"]);
    }
}
