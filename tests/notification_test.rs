//! Control channel and observer connection over loopback UDP.

use async_trait::async_trait;
use rust_fec::network::{
    ChannelPhase, ControlChannel, NotifyMessage, ObserverConnection, ObserverEvent, ObserverHandler,
    SocketAddress,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing_test::traced_test;

async fn observer() -> (ObserverConnection, SocketAddress) {
    let connection = ObserverConnection::bind("127.0.0.1:0").await.unwrap();
    let port = connection.local_addr().unwrap().port();
    (connection, SocketAddress::new("127.0.0.1", port, None))
}

#[tokio::test]
async fn test_start_resume_reaches_each_observer_once() {
    let (first, first_addr) = observer().await;
    let (second, second_addr) = observer().await;

    let channel = ControlChannel::connect(
        [first_addr.clone(), second_addr, first_addr],
        false,
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    assert_eq!(channel.observers().len(), 2);

    channel.send_start_resume_notification().await.unwrap();

    for connection in [&first, &second] {
        let event = connection.receive(Duration::from_secs(5)).await.unwrap();
        assert_eq!(event, Some(ObserverEvent::StartResume));
        let duplicate = connection.receive(Duration::from_millis(100)).await.unwrap();
        assert_eq!(duplicate, None);
    }
    channel.close().await;
}

#[tokio::test]
async fn test_read_confirmation_gates_start() {
    let (connection, address) = observer().await;
    let channel = ControlChannel::connect([address.clone()], true, Duration::from_secs(5))
        .await
        .unwrap();

    channel
        .send_read_notification(Some(Path::new("/tmp/run/data.sqlite3")))
        .await
        .unwrap();
    assert_eq!(channel.phase().await, ChannelPhase::ReadySent);

    let event = connection.receive(Duration::from_secs(5)).await.unwrap();
    assert_eq!(
        event,
        Some(ObserverEvent::DatabaseReady(Some("/tmp/run/data.sqlite3".to_string())))
    );

    let report = channel.wait_for_confirmation().await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.confirmed, vec![address]);

    channel.send_start_resume_notification().await.unwrap();
    assert_eq!(
        connection.receive(Duration::from_secs(5)).await.unwrap(),
        Some(ObserverEvent::StartResume)
    );
    channel.send_stop_pause_notification().await.unwrap();
    assert_eq!(
        connection.receive(Duration::from_secs(5)).await.unwrap(),
        Some(ObserverEvent::StopPause)
    );
    channel.close().await;
}

#[tokio::test]
#[traced_test]
async fn test_silent_observer_times_out_with_warning() {
    // Receives notifications but never confirms
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = SocketAddress::new("127.0.0.1", silent.local_addr().unwrap().port(), None);
    let (responsive, responsive_addr) = observer().await;

    let channel = ControlChannel::connect(
        [silent_addr.clone(), responsive_addr.clone()],
        true,
        Duration::from_millis(300),
    )
    .await
    .unwrap();
    channel.send_read_notification(None).await.unwrap();
    responsive.receive(Duration::from_secs(5)).await.unwrap();

    let report = channel.wait_for_confirmation().await.unwrap();
    assert!(!report.is_complete());
    assert_eq!(report.confirmed, vec![responsive_addr]);
    assert_eq!(report.unconfirmed, vec![silent_addr]);
    assert!(logs_contain("Observers never confirmed reading the database"));

    // the run carries on regardless
    channel.send_start_resume_notification().await.unwrap();
    assert_eq!(channel.phase().await, ChannelPhase::RunActive);
}

#[tokio::test]
async fn test_close_during_wait_returns_promptly() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = SocketAddress::new("127.0.0.1", silent.local_addr().unwrap().port(), None);
    let channel = Arc::new(
        ControlChannel::connect([address], true, Duration::from_secs(60))
            .await
            .unwrap(),
    );
    channel.send_read_notification(None).await.unwrap();

    let waiter = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.wait_for_confirmation().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    channel.close().await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("wait should end once the channel closes")
        .unwrap();
    // Either the wait observed the cancellation or its task was aborted
    if let Ok(report) = outcome {
        assert!(!report.is_complete());
    }
    channel.close().await;
    assert_eq!(channel.phase().await, ChannelPhase::Stopped);
}

#[tokio::test]
async fn test_read_notification_only_once() {
    let (_connection, address) = observer().await;
    let channel = ControlChannel::connect([address], false, Duration::from_secs(1))
        .await
        .unwrap();
    channel.send_read_notification(None).await.unwrap();
    assert!(channel.send_read_notification(None).await.is_err());
}

#[derive(Default)]
struct Recorder {
    paths: Mutex<Vec<Option<String>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

#[async_trait]
impl ObserverHandler for Recorder {
    async fn database_ready(&self, database_path: Option<&str>) {
        self.paths.lock().unwrap().push(database_path.map(String::from));
    }

    async fn start_resume(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    async fn stop_pause(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_observer_run_loop_dispatches_callbacks() {
    let (connection, address) = observer().await;
    let connection = Arc::new(connection);
    let handler = Arc::new(Recorder::default());

    let runner = {
        let connection = connection.clone();
        let handler = handler.clone();
        tokio::spawn(async move { connection.run(handler.as_ref(), Duration::from_millis(20)).await })
    };

    let channel = ControlChannel::connect([address], true, Duration::from_secs(5))
        .await
        .unwrap();
    channel
        .send_read_notification(Some(Path::new("db.sqlite3")))
        .await
        .unwrap();
    channel.send_start_resume_notification().await.unwrap();
    channel.send_stop_pause_notification().await.unwrap();
    channel.send_start_resume_notification().await.unwrap();

    // Malformed datagrams are skipped by the loop
    let stray = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    stray
        .send_to(&[0xFF, 0xFF], connection.local_addr().unwrap())
        .await
        .unwrap();
    stray
        .send_to(&NotifyMessage::StopPause.encode().unwrap(), connection.local_addr().unwrap())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while handler.stops.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    connection.close();
    runner.await.unwrap().unwrap();
    assert_eq!(*handler.paths.lock().unwrap(), vec![Some("db.sqlite3".to_string())]);
    assert_eq!(handler.starts.load(Ordering::SeqCst), 2);
    channel.close().await;
}
