//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Exec channels, shells and
//! the SFTP subsystem all ask it for channels through a `HandleController`
//! which sends commands over an mpsc channel. No `Arc<Mutex<Handle>>` and no
//! lock held across `.await`.
//!
//! Between commands the task sends keepalives. A transport that errors, or
//! stays silent for `MAX_MISSED_KEEPALIVES` rounds, ends the task, which is
//! what `HandleController::is_connected` reports.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (exec, PTY shell or subsystem)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Close the connection and stop the task
    Disconnect,
}

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_MISSED_KEEPALIVES: u32 = 3;

/// Cloneable front end of the owner task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Open a new session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// False once the owner task has exited, whether asked to or because the
    /// transport died
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task, moving `handle` into it.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let handle = handle;
        info!("Handle owner task started for {}", label);

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        keepalive.tick().await;
        let mut missed = 0u32;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenSession { reply_tx }) => {
                        let result = handle.channel_open_session().await;
                        if reply_tx.send(result).is_err() {
                            warn!("Caller dropped before receiving channel_open_session result");
                        }
                    }
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for {}", label);
                        break;
                    }
                    None => break,
                },
                _ = keepalive.tick() => {
                    match tokio::time::timeout(KEEPALIVE_TIMEOUT, handle.send_keepalive(true)).await {
                        Ok(Ok(())) => {
                            debug!("Keepalive OK for {}", label);
                            missed = 0;
                        }
                        Ok(Err(e)) => {
                            warn!("Keepalive failed for {}: {:?}", label, e);
                            break;
                        }
                        Err(_) => {
                            missed += 1;
                            warn!(
                                "Keepalive timeout for {} ({}/{})",
                                label, missed, MAX_MISSED_KEEPALIVES
                            );
                            if missed >= MAX_MISSED_KEEPALIVES {
                                break;
                            }
                        }
                    }
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController { cmd_tx }
}

/// Answer every queued command with a disconnect error
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        if let HandleCommand::ChannelOpenSession { reply_tx } = cmd {
            let _ = reply_tx.send(Err(russh::Error::Disconnect));
        }
    }
}
