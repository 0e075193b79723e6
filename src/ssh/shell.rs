//! Command channel
//!
//! [`RemoteShell`] is what the session core needs from the SSH command
//! connection: one-shot commands that run to completion, and interactive PTY
//! shells driven through channels.

use async_trait::async_trait;
use russh::ChannelMsg;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::error::SshError;
use super::handle_owner::HandleController;

/// Result of a one-shot command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    /// stdout followed by stderr, the way a terminal would show them
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Input to an interactive shell
#[derive(Debug)]
pub enum ShellInput {
    Data(Vec<u8>),
    Resize(u16, u16),
    Close,
}

/// Requested pseudo-terminal
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            cols: 80,
            rows: 60,
        }
    }
}

/// An open interactive shell. Dropping every input sender closes it.
pub struct ShellChannel {
    pub input: mpsc::Sender<ShellInput>,
    pub output: broadcast::Sender<Vec<u8>>,
    /// Cancelling stops the channel task and closes the remote shell
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` and wait for it to finish
    async fn exec(&self, command: &str) -> Result<CommandOutput, SshError>;

    /// Request a PTY and start an interactive shell on it
    async fn open_pty(&self, pty: PtyRequest) -> Result<ShellChannel, SshError>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);
}

/// [`RemoteShell`] over a russh connection
pub struct RusshShell {
    controller: HandleController,
}

impl RusshShell {
    pub fn new(controller: HandleController) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl RemoteShell for RusshShell {
    async fn exec(&self, command: &str) -> Result<CommandOutput, SshError> {
        let mut channel = self.controller.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelError(format!("exec failed: {}", e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        // ExitStatus may arrive after Eof, so read until the channel is gone
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, .. } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        debug!("exec `{}` finished with {:?}", command, exit_status);

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    async fn open_pty(&self, pty: PtyRequest) -> Result<ShellChannel, SshError> {
        let channel = self.controller.open_session_channel().await?;

        channel
            .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, &[])
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

        let (input_tx, mut input_rx) = mpsc::channel::<ShellInput>(1024);
        let (output_tx, _) = broadcast::channel::<Vec<u8>>(1024);
        let cancel = CancellationToken::new();

        let output = output_tx.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut channel = channel;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = channel.eof().await;
                        let _ = channel.close().await;
                        break;
                    }
                    input = input_rx.recv() => match input {
                        Some(ShellInput::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to send data to shell: {}", e);
                                break;
                            }
                        }
                        Some(ShellInput::Resize(cols, rows)) => {
                            if let Err(e) = channel.window_change(cols as u32, rows as u32, 0, 0).await {
                                error!("Failed to resize PTY: {}", e);
                            }
                        }
                        Some(ShellInput::Close) | None => {
                            let _ = channel.eof().await;
                            break;
                        }
                    },
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            let _ = output.send(data.to_vec());
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                            let _ = output.send(data.to_vec());
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    },
                }
            }
            token.cancel();
            info!("Interactive shell closed");
        });

        Ok(ShellChannel {
            input: input_tx,
            output: output_tx,
            cancel,
        })
    }

    fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    async fn disconnect(&self) {
        self.controller.disconnect().await;
    }
}
