//! Notification protocol: tells external observers when the database is ready to read and when
//! the run starts, pauses, resumes or stops.
//!
//! One UDP socket is opened per distinct observer. The ready notification is broadcast on a
//! background task which, when configured to, also collects a confirmation from every observer
//! before a bounded deadline. Starting the run waits for those confirmations first.
//!
//! ```text
//! Idle -> ReadySent -> RunActive -> PauseSent <-> ResumeSent
//!   any phase --close()--> Stopped (terminal)
//! ```

use crate::config::NotificationConfig;
use crate::error::{FecError, FecResult};
use crate::network::protocol::NotifyMessage;
use crate::network::SocketAddress;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

const RECEIVE_BUFFER_BYTES: usize = 1024;

/// Where the run is, as far as observers have been told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Idle,
    ReadySent,
    RunActive,
    PauseSent,
    ResumeSent,
    Stopped,
}

impl fmt::Display for ChannelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelPhase::Idle => "idle",
            ChannelPhase::ReadySent => "ready-sent",
            ChannelPhase::RunActive => "run-active",
            ChannelPhase::PauseSent => "pause-sent",
            ChannelPhase::ResumeSent => "resume-sent",
            ChannelPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Outcome of waiting for observers to confirm they have read the database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmationReport {
    pub confirmed: Vec<SocketAddress>,
    pub unconfirmed: Vec<SocketAddress>,
}

impl ConfirmationReport {
    pub fn is_complete(&self) -> bool {
        self.unconfirmed.is_empty()
    }
}

struct Observer {
    address: SocketAddress,
    socket: UdpSocket,
}

struct ChannelState {
    phase: ChannelPhase,
    observers: Option<Arc<[Observer]>>,
    pending: Option<JoinHandle<ConfirmationReport>>,
}

/// Broadcasts run-control notifications to a fixed set of observers.
pub struct ControlChannel {
    wait_for_read_confirmation: bool,
    confirmation_timeout: Duration,
    send_database_path: bool,
    addresses: Vec<SocketAddress>,
    state: Mutex<ChannelState>,
    cancel: watch::Sender<bool>,
}

impl ControlChannel {
    /// Opens one socket per distinct observer address.
    pub async fn connect<I>(
        addresses: I,
        wait_for_read_confirmation: bool,
        confirmation_timeout: Duration,
    ) -> FecResult<Self>
    where
        I: IntoIterator<Item = SocketAddress>,
    {
        let unique: BTreeSet<SocketAddress> = addresses.into_iter().collect();
        let mut observers = Vec::with_capacity(unique.len());
        for address in unique {
            let socket = UdpSocket::bind(("0.0.0.0", address.listen_port.unwrap_or(0))).await?;
            socket.connect(address.remote()).await?;
            debug!(observer = %address, "Opened notification socket");
            observers.push(Observer { address, socket });
        }
        let addresses = observers.iter().map(|o| o.address.clone()).collect();
        let (cancel, _) = watch::channel(false);

        Ok(Self {
            wait_for_read_confirmation,
            confirmation_timeout,
            send_database_path: true,
            addresses,
            state: Mutex::new(ChannelState {
                phase: ChannelPhase::Idle,
                observers: Some(observers.into()),
                pending: None,
            }),
            cancel,
        })
    }

    pub async fn from_config(config: &NotificationConfig) -> FecResult<Self> {
        let channel = Self::connect(
            config.observers.iter().cloned(),
            config.wait_for_read_confirmation,
            config.confirmation_timeout(),
        )
        .await?;
        Ok(channel.with_database_path(config.send_database_path))
    }

    /// Whether ready notifications carry the database path. On by default.
    pub fn with_database_path(mut self, send: bool) -> Self {
        self.send_database_path = send;
        self
    }

    /// Distinct observers this channel notifies, in a stable order.
    pub fn observers(&self) -> &[SocketAddress] {
        &self.addresses
    }

    pub async fn phase(&self) -> ChannelPhase {
        self.state.lock().await.phase
    }

    /// Tells every observer the database at `database_path` is ready. The path is left out
    /// when the channel was configured not to send it.
    ///
    /// Returns as soon as the broadcast has been handed to a background task; use
    /// [`wait_for_confirmation`](Self::wait_for_confirmation) to collect the replies.
    pub async fn send_read_notification(&self, database_path: Option<&Path>) -> FecResult<()> {
        let message = NotifyMessage::DatabaseReady(
            database_path
                .filter(|_| self.send_database_path)
                .map(|p| p.to_string_lossy().into_owned()),
        );
        let datagram = message.encode()?;

        let mut state = self.state.lock().await;
        match state.phase {
            ChannelPhase::Idle => {}
            ChannelPhase::Stopped => return Err(FecError::ChannelClosed),
            phase => {
                return Err(FecError::InvalidTransition {
                    action: "send the database ready notification",
                    phase: phase.to_string(),
                })
            }
        }
        let observers = state.observers.clone().ok_or(FecError::ChannelClosed)?;

        info!("*** Notifying external sources that the database is ready for reading ***");
        let wait = self.wait_for_read_confirmation;
        let deadline = Instant::now() + self.confirmation_timeout;
        let cancel = self.cancel.subscribe();
        state.pending = Some(tokio::spawn(async move {
            broadcast(&observers, &datagram).await;
            if !wait {
                return ConfirmationReport::default();
            }
            collect_confirmations(&observers, deadline, cancel).await
        }));
        state.phase = ChannelPhase::ReadySent;
        Ok(())
    }

    /// Blocks the calling task until every observer has confirmed or the timeout elapses.
    ///
    /// Observers that never replied are logged and listed in the report; the run is free to
    /// continue without them.
    pub async fn wait_for_confirmation(&self) -> FecResult<ConfirmationReport> {
        // Released before awaiting so close() can always get in.
        let pending = self.state.lock().await.pending.take();
        let Some(handle) = pending else {
            return Ok(ConfirmationReport::default());
        };

        info!("*** Awaiting for a response from an external source to state its ready for the simulation to start ***");
        let report = handle.await?;
        if report.is_complete() {
            info!(confirmed = report.confirmed.len(), "*** Confirmation received, continuing ***");
        } else {
            let missing: Vec<String> = report.unconfirmed.iter().map(ToString::to_string).collect();
            warn!(
                unconfirmed = ?missing,
                "Observers never confirmed reading the database - continuing"
            );
        }
        Ok(report)
    }

    /// Tells every observer the run has started, or resumed after a pause.
    pub async fn send_start_resume_notification(&self) -> FecResult<()> {
        let phase = self.phase().await;
        let next = match phase {
            ChannelPhase::Idle | ChannelPhase::ReadySent => ChannelPhase::RunActive,
            ChannelPhase::PauseSent => ChannelPhase::ResumeSent,
            ChannelPhase::Stopped => return Err(FecError::ChannelClosed),
            phase => {
                return Err(FecError::InvalidTransition {
                    action: "start or resume",
                    phase: phase.to_string(),
                })
            }
        };

        if self.wait_for_read_confirmation {
            self.wait_for_confirmation().await?;
        }
        self.send(NotifyMessage::StartResume, next).await
    }

    /// Tells every observer the run has stopped or paused.
    pub async fn send_stop_pause_notification(&self) -> FecResult<()> {
        let next = match self.phase().await {
            ChannelPhase::RunActive | ChannelPhase::ResumeSent => ChannelPhase::PauseSent,
            ChannelPhase::Stopped => return Err(FecError::ChannelClosed),
            phase => {
                return Err(FecError::InvalidTransition {
                    action: "stop or pause",
                    phase: phase.to_string(),
                })
            }
        };
        self.send(NotifyMessage::StopPause, next).await
    }

    async fn send(&self, message: NotifyMessage, next: ChannelPhase) -> FecResult<()> {
        let datagram = message.encode()?;
        let mut state = self.state.lock().await;
        let observers = state.observers.clone().ok_or(FecError::ChannelClosed)?;
        debug!(?message, observers = observers.len(), "Broadcasting notification");
        broadcast(&observers, &datagram).await;
        state.phase = next;
        Ok(())
    }

    /// Releases the sockets and cancels any outstanding confirmation wait. Safe to call more
    /// than once, and while a wait is in flight.
    pub async fn close(&self) {
        self.cancel.send_replace(true);
        let mut state = self.state.lock().await;
        if state.phase == ChannelPhase::Stopped {
            return;
        }
        debug!("[notification] Stopping");
        state.phase = ChannelPhase::Stopped;
        state.observers = None;
        if let Some(handle) = state.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

async fn broadcast(observers: &[Observer], datagram: &[u8]) {
    for observer in observers {
        if let Err(e) = observer.socket.send(datagram).await {
            warn!(observer = %observer.address, error = %e, "Failed to notify external application");
        }
    }
}

async fn collect_confirmations(
    observers: &[Observer],
    deadline: Instant,
    cancel: watch::Receiver<bool>,
) -> ConfirmationReport {
    let results = futures::future::join_all(
        observers
            .iter()
            .map(|observer| await_confirmation(observer, deadline, cancel.clone())),
    )
    .await;

    let mut report = ConfirmationReport::default();
    for (observer, confirmed) in observers.iter().zip(results) {
        if confirmed {
            report.confirmed.push(observer.address.clone());
        } else {
            report.unconfirmed.push(observer.address.clone());
        }
    }
    report
}

async fn await_confirmation(
    observer: &Observer,
    deadline: Instant,
    mut cancel: watch::Receiver<bool>,
) -> bool {
    let mut buf = [0u8; RECEIVE_BUFFER_BYTES];
    loop {
        let received = tokio::select! {
            _ = cancel.wait_for(|cancelled| *cancelled) => return false,
            received = timeout_at(deadline, observer.socket.recv(&mut buf)) => received,
        };
        match received {
            Err(_) => return false,
            Ok(Err(e)) => {
                debug!(observer = %observer.address, error = %e, "Receive failed while awaiting confirmation");
                return false;
            }
            Ok(Ok(n)) => match NotifyMessage::decode(&buf[..n]) {
                Ok(NotifyMessage::DatabaseReady(_)) => return true,
                Ok(other) => debug!(observer = %observer.address, ?other, "Ignoring unexpected message"),
                Err(e) => debug!(observer = %observer.address, error = %e, "Ignoring malformed reply"),
            },
        }
    }
}
