//! Observer side of the notification protocol.
//!
//! An external reader binds an [`ObserverConnection`] on its notify port, waits for the
//! database to be ready, confirms, and then follows the run through start/pause events.

use crate::error::{FecError, FecResult};
use crate::network::protocol::NotifyMessage;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const RECEIVE_BUFFER_BYTES: usize = 65_536;

/// A notification as seen by an observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    DatabaseReady(Option<String>),
    StartResume,
    StopPause,
}

/// Callbacks run by [`ObserverConnection::run`]. Every hook defaults to doing nothing.
#[async_trait]
pub trait ObserverHandler: Send + Sync {
    /// Runs before the confirmation is sent, so the database can be opened first.
    async fn database_ready(&self, _database_path: Option<&str>) {}

    async fn start_resume(&self) {}

    async fn stop_pause(&self) {}
}

pub struct ObserverConnection {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl ObserverConnection {
    pub async fn bind(local: impl ToSocketAddrs) -> FecResult<Self> {
        let socket = UdpSocket::bind(local).await?;
        Ok(Self {
            socket,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> FecResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Waits up to `wait` for the next notification. A DATABASE message is confirmed to its
    /// sender before it is returned. `Ok(None)` means nothing arrived in time.
    pub async fn receive(&self, wait: Duration) -> FecResult<Option<ObserverEvent>> {
        self.receive_with(wait, |_| async {}).await
    }

    async fn receive_with<F, Fut>(&self, wait: Duration, on_ready: F) -> FecResult<Option<ObserverEvent>>
    where
        F: FnOnce(Option<String>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(FecError::ChannelClosed);
        }

        let mut buf = vec![0u8; RECEIVE_BUFFER_BYTES];
        let (n, sender) = match timeout(wait, self.socket.recv_from(&mut buf)).await {
            Err(_) => return Ok(None),
            Ok(result) => result?,
        };

        let event = match NotifyMessage::decode(&buf[..n])? {
            NotifyMessage::DatabaseReady(path) => {
                info!(?path, "Database is ready for reading");
                on_ready(path.clone()).await;
                let reply = NotifyMessage::DatabaseReady(None).encode()?;
                self.socket.send_to(&reply, sender).await?;
                debug!(%sender, "Confirmed database read");
                ObserverEvent::DatabaseReady(path)
            }
            NotifyMessage::StartResume => ObserverEvent::StartResume,
            NotifyMessage::StopPause => ObserverEvent::StopPause,
        };
        Ok(Some(event))
    }

    /// Dispatches notifications to `handler` until [`close`](Self::close) is called.
    ///
    /// Each receive is bounded by `poll` so a close is noticed promptly. Malformed datagrams are
    /// logged and skipped.
    pub async fn run<H: ObserverHandler>(&self, handler: &H, poll: Duration) -> FecResult<()> {
        while !self.closed.load(Ordering::Acquire) {
            let received = self
                .receive_with(poll, |path| async move {
                    handler.database_ready(path.as_deref()).await;
                })
                .await;
            match received {
                Ok(Some(ObserverEvent::StartResume)) => handler.start_resume().await,
                Ok(Some(ObserverEvent::StopPause)) => handler.stop_pause().await,
                Ok(Some(ObserverEvent::DatabaseReady(_))) | Ok(None) => {}
                Err(FecError::ChannelClosed) => break,
                Err(FecError::Protocol(msg)) => warn!("Ignoring notification: {msg}"),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stops [`run`](Self::run) at its next poll. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Observer connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_times_out_quietly() {
        let observer = ObserverConnection::bind("127.0.0.1:0").await.unwrap();
        let event = observer.receive(Duration::from_millis(20)).await.unwrap();
        assert_eq!(event, None);
    }

    #[tokio::test]
    async fn test_database_message_is_confirmed() {
        let observer = ObserverConnection::bind("127.0.0.1:0").await.unwrap();
        let toolchain = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        toolchain.connect(observer.local_addr().unwrap()).await.unwrap();

        let ready = NotifyMessage::DatabaseReady(Some("/tmp/db.sqlite3".into()));
        toolchain.send(&ready.encode().unwrap()).await.unwrap();

        let event = observer.receive(Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            event,
            Some(ObserverEvent::DatabaseReady(Some("/tmp/db.sqlite3".into())))
        );

        let mut buf = [0u8; 16];
        let n = toolchain.recv(&mut buf).await.unwrap();
        assert_eq!(
            NotifyMessage::decode(&buf[..n]).unwrap(),
            NotifyMessage::DatabaseReady(None)
        );
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_receive() {
        let observer = ObserverConnection::bind("127.0.0.1:0").await.unwrap();
        observer.close();
        observer.close();
        assert!(observer.is_closed());
        assert!(matches!(
            observer.receive(Duration::from_millis(10)).await,
            Err(FecError::ChannelClosed)
        ));
    }
}
