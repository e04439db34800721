//! End-to-end tests over loopback sockets: real listeners, real clients.

use std::sync::{atomic::AtomicBool, Arc};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use ev_central::application::coordinator::{Coordinator, CoordinatorSettings};
use ev_central::infrastructure::network::{bind, run_listener, FramedTransport, LineTransport, Transport};
use ev_central::infrastructure::storage::MemoryRepository;
use ev_core::protocol::{
    decode_line, encode_line, receive_and_ack, send_and_await_ack, CentralMessage, CpMessage, DriverMessage, Hello,
    PeerRole,
};
use ev_core::{CpStatus, HealthStatus, Inbound, SessionState};

const WAIT: Duration = Duration::from_secs(5);

// ── Harness ───────────────────────────────────────────────────────────────────

async fn serve<T: Transport + 'static>(transport: T) -> (Arc<Coordinator>, String, Arc<AtomicBool>) {
    let coordinator = Arc::new(Coordinator::new(
        Arc::new(MemoryRepository::new()),
        CoordinatorSettings::default(),
    ));
    let listener = bind("127.0.0.1:0", transport.name()).await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let running = Arc::new(AtomicBool::new(true));
    tokio::spawn(run_listener(
        listener,
        Arc::new(transport),
        Arc::clone(&coordinator),
        Arc::clone(&running),
    ));
    (coordinator, addr, running)
}

/// Polls until `check` holds or the test deadline passes.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(WAIT, async {
        while !check().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

struct LineClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl LineClient {
    async fn connect(addr: &str, hello: &Hello) -> Self {
        let (read_half, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut client = Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        };
        client.send(hello).await;
        client
    }

    async fn send<T: serde::Serialize>(&mut self, message: &T) {
        let line = encode_line(message).unwrap();
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> CentralMessage {
        let line = timeout(WAIT, self.lines.next_line())
            .await
            .expect("no line in time")
            .unwrap()
            .expect("connection closed");
        decode_line(&line).unwrap()
    }

    /// Skips messages until one matches `wanted`.
    async fn recv_until(&mut self, wanted: impl Fn(&CentralMessage) -> bool) -> CentralMessage {
        loop {
            let message = self.recv().await;
            if wanted(&message) {
                return message;
            }
        }
    }
}

fn hello(role: PeerRole, id: &str) -> Hello {
    Hello {
        role,
        id: id.to_string(),
        location: None,
        price_per_kwh: None,
        max_power: None,
    }
}

fn supply_state(state: SessionState) -> impl Fn(&CentralMessage) -> bool {
    move |m| matches!(m, CentralMessage::SupplyStatus(s) if s.state == state)
}

// ── Line transport ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_line_peers_run_a_full_session() {
    // Arrange
    let (coordinator, addr, _running) = serve(LineTransport).await;
    let mut cp_hello = hello(PeerRole::ChargingPoint, "ALC1");
    cp_hello.location = Some("Calle Mayor 1".into());
    let mut cp = LineClient::connect(&addr, &cp_hello).await;
    assert!(matches!(cp.recv().await, CentralMessage::Welcome { role: PeerRole::ChargingPoint, .. }));
    eventually(|| {
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.is_connected(PeerRole::ChargingPoint, "ALC1").await }
    })
    .await;

    let mut driver = LineClient::connect(&addr, &hello(PeerRole::Driver, "D1")).await;
    assert!(matches!(driver.recv().await, CentralMessage::Welcome { role: PeerRole::Driver, .. }));
    let CentralMessage::Snapshot { charging_points } = driver.recv().await else {
        panic!("expected a snapshot after the welcome");
    };
    assert_eq!(charging_points.len(), 1);
    assert_eq!(charging_points[0].status, CpStatus::Available);

    // Act – request
    driver
        .send(&DriverMessage::RequestSupply {
            cp_id: "ALC1".into(),
            requested_energy: Some(10.0),
        })
        .await;

    // Assert – both sides hear about the new session
    driver.recv_until(supply_state(SessionState::Pending)).await;
    let CentralMessage::AuthorizeSupply {
        session_id,
        driver_id,
        requested_energy,
    } = cp.recv().await
    else {
        panic!("expected an authorization prompt");
    };
    assert_eq!(driver_id, "D1");
    assert_eq!(requested_energy, Some(10.0));

    // Act – the CP runs the session to completion
    cp.send(&CpMessage::AuthorizationResponse {
        session_id: session_id.clone(),
        accepted: true,
        reason: None,
    })
    .await;
    cp.send(&CpMessage::SupplyStarted {
        session_id: session_id.clone(),
    })
    .await;
    cp.send(&CpMessage::SupplyUpdate {
        session_id: session_id.clone(),
        energy: 4.0,
        amount: None,
    })
    .await;
    cp.send(&CpMessage::SupplyFinished {
        session_id: session_id.clone(),
        success: true,
        message: None,
    })
    .await;

    // Assert
    driver.recv_until(supply_state(SessionState::InProgress)).await;
    let update = driver
        .recv_until(|m| matches!(m, CentralMessage::SupplyUpdate { .. }))
        .await;
    let CentralMessage::SupplyUpdate { session } = update else {
        unreachable!()
    };
    assert!((session.amount_due - 1.4).abs() < 1e-9);
    let CentralMessage::SupplyStatus(finished) = driver.recv_until(supply_state(SessionState::Finished)).await
    else {
        unreachable!()
    };
    assert_eq!(finished.session.map(|s| s.id), Some(session_id));
    assert_eq!(
        coordinator.charging_point("ALC1").await.unwrap().status,
        CpStatus::Available
    );
}

#[tokio::test]
async fn test_line_cp_hangup_marks_it_disconnected() {
    // Arrange
    let (coordinator, addr, _running) = serve(LineTransport).await;
    let mut cp = LineClient::connect(&addr, &hello(PeerRole::ChargingPoint, "ALC7")).await;
    cp.recv().await;
    let mut driver = LineClient::connect(&addr, &hello(PeerRole::Driver, "D1")).await;
    driver.recv().await;
    eventually(|| {
        let coordinator = Arc::clone(&coordinator);
        async move {
            coordinator.is_connected(PeerRole::Driver, "D1").await
                && coordinator.is_connected(PeerRole::ChargingPoint, "ALC7").await
        }
    })
    .await;

    // Act
    drop(cp);

    // Assert
    let CentralMessage::CpState { cp: view, .. } = driver
        .recv_until(|m| matches!(m, CentralMessage::CpState { cp, .. } if cp.status == CpStatus::Disconnected))
        .await
    else {
        unreachable!()
    };
    assert_eq!(view.cp_id, "ALC7");
    assert!(!coordinator.is_connected(PeerRole::ChargingPoint, "ALC7").await);
}

#[tokio::test]
async fn test_line_health_report_and_malformed_lines() {
    // Arrange
    let (coordinator, addr, _running) = serve(LineTransport).await;
    let mut cp = LineClient::connect(&addr, &hello(PeerRole::ChargingPoint, "ALC1")).await;
    cp.recv().await;

    // Act
    cp.writer.write_all(b"this is not json\n\n").await.unwrap();
    cp.send(&CpMessage::Health {
        status: HealthStatus::Fault,
        message: Some("overheat".into()),
    })
    .await;

    // Assert
    eventually(|| {
        let coordinator = Arc::clone(&coordinator);
        async move {
            coordinator
                .charging_point("ALC1")
                .await
                .is_some_and(|cp| cp.status == CpStatus::Fault)
        }
    })
    .await;
}

#[tokio::test]
async fn test_line_bad_handshake_gets_an_error_and_is_closed() {
    // Arrange
    let (_coordinator, addr, _running) = serve(LineTransport).await;
    let (read_half, mut writer) = TcpStream::connect(&addr).await.unwrap().into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Act
    writer.write_all(b"{\"role\":\"spaceship\",\"id\":\"X\"}\n").await.unwrap();

    // Assert
    let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap();
    assert!(matches!(decode_line::<CentralMessage>(&line).unwrap(), CentralMessage::Error { .. }));
    let after = timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
    assert_eq!(after, None);
}

// ── Framed transport ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_framed_request_for_unknown_cp_is_denied() {
    // Arrange
    let (coordinator, addr, _running) = serve(FramedTransport::default()).await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();

    // Act
    send_and_await_ack(&mut stream, "REQ#D9#GHOST", WAIT).await.unwrap();
    let reply = receive_and_ack(&mut stream, WAIT).await.unwrap();

    // Assert
    assert_eq!(reply, Inbound::Frame("AUTH_DENIED#CP_NOT_FOUND".to_string()));
    assert!(coordinator.active_sessions().await.is_empty());
}

#[tokio::test]
async fn test_framed_monitor_and_driver_get_a_grant() {
    // Arrange
    let (coordinator, addr, _running) = serve(FramedTransport::default()).await;
    let mut monitor = TcpStream::connect(&addr).await.unwrap();
    send_and_await_ack(&mut monitor, "AUTH#ALC1", WAIT).await.unwrap();
    eventually(|| {
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.is_connected(PeerRole::ChargingPoint, "ALC1").await }
    })
    .await;

    // Act
    let mut driver = TcpStream::connect(&addr).await.unwrap();
    send_and_await_ack(&mut driver, "REQ#D1#ALC1", WAIT).await.unwrap();
    let reply = receive_and_ack(&mut driver, WAIT).await.unwrap();

    // Assert
    assert_eq!(reply, Inbound::Frame("AUTH_GRANTED#ALC1#D1".to_string()));
    let cp = coordinator.charging_point("ALC1").await.unwrap();
    assert_eq!(cp.status, CpStatus::PendingAuth);

    // Act – driver gives up before authorization
    send_and_await_ack(&mut driver, "FINISH#ALC1#D1", WAIT).await.unwrap();

    // Assert
    eventually(|| {
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.active_sessions().await.is_empty() }
    })
    .await;
    assert_eq!(coordinator.recent_sessions().await[0].state, SessionState::Aborted);
}

#[tokio::test]
async fn test_framed_fault_report_marks_cp_faulty() {
    // Arrange
    let (coordinator, addr, _running) = serve(FramedTransport::default()).await;
    let mut monitor = TcpStream::connect(&addr).await.unwrap();
    send_and_await_ack(&mut monitor, "AUTH#ALC3", WAIT).await.unwrap();

    // Act
    send_and_await_ack(&mut monitor, "FAULT#ALC3#cooling failure", WAIT).await.unwrap();

    // Assert
    eventually(|| {
        let coordinator = Arc::clone(&coordinator);
        async move {
            coordinator
                .charging_point("ALC3")
                .await
                .is_some_and(|cp| cp.status == CpStatus::Fault)
        }
    })
    .await;
}

#[tokio::test]
async fn test_framed_corrupt_frame_is_nacked() {
    // Arrange
    let (_coordinator, addr, _running) = serve(FramedTransport::default()).await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let mut frame = ev_core::encode_frame("AUTH#ALC1");
    let last = frame.len() - 2;
    frame[last] ^= 0xFF;

    // Act
    stream.write_all(&frame).await.unwrap();
    let mut reply = [0u8; 1];
    timeout(WAIT, tokio::io::AsyncReadExt::read_exact(&mut stream, &mut reply))
        .await
        .unwrap()
        .unwrap();

    // Assert
    assert_eq!(reply[0], ev_core::protocol::NACK);
}

// ── Superseded connections ────────────────────────────────────────────────────

#[tokio::test]
async fn test_framed_replaced_connection_stays_open() {
    // Arrange
    let (coordinator, addr, _running) = serve(FramedTransport::default()).await;
    let mut first = TcpStream::connect(&addr).await.unwrap();
    send_and_await_ack(&mut first, "AUTH#ALC1", WAIT).await.unwrap();
    let mut second = TcpStream::connect(&addr).await.unwrap();
    send_and_await_ack(&mut second, "AUTH#ALC1", WAIT).await.unwrap();
    // A second confirmed frame means the new connection is past its attach.
    send_and_await_ack(&mut second, "AUTH#ALC1", WAIT).await.unwrap();

    // Act
    let heartbeat = send_and_await_ack(&mut first, "AUTH#ALC1", WAIT).await;
    let fault = send_and_await_ack(&mut first, "FAULT#ALC1#door open", WAIT).await;

    // Assert
    assert!(heartbeat.is_ok(), "older socket was closed: {heartbeat:?}");
    assert!(fault.is_ok(), "older socket was closed: {fault:?}");
    eventually(|| {
        let coordinator = Arc::clone(&coordinator);
        async move {
            coordinator
                .charging_point("ALC1")
                .await
                .is_some_and(|cp| cp.status == CpStatus::Fault)
        }
    })
    .await;
    assert!(coordinator.is_connected(PeerRole::ChargingPoint, "ALC1").await);
}

#[tokio::test]
async fn test_line_replaced_connection_stays_open() {
    // Arrange
    let (coordinator, addr, _running) = serve(LineTransport).await;
    let mut driver = LineClient::connect(&addr, &hello(PeerRole::Driver, "D1")).await;
    driver.recv().await;
    eventually(|| {
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.is_connected(PeerRole::Driver, "D1").await }
    })
    .await;
    let mut first = LineClient::connect(&addr, &hello(PeerRole::ChargingPoint, "ALC1")).await;
    first.recv().await;
    driver
        .recv_until(|m| matches!(m, CentralMessage::CpState { .. }))
        .await;
    let mut second = LineClient::connect(&addr, &hello(PeerRole::ChargingPoint, "ALC1")).await;
    second.recv().await;
    driver
        .recv_until(|m| matches!(m, CentralMessage::CpState { .. }))
        .await;

    // Act
    first
        .send(&CpMessage::Health {
            status: HealthStatus::Fault,
            message: Some("door open".into()),
        })
        .await;

    // Assert
    let CentralMessage::CpState { cp, health_message } = driver
        .recv_until(|m| matches!(m, CentralMessage::CpState { cp, .. } if cp.status == CpStatus::Fault))
        .await
    else {
        unreachable!()
    };
    assert_eq!(cp.cp_id, "ALC1");
    assert_eq!(health_message.as_deref(), Some("door open"));
    assert!(coordinator.is_connected(PeerRole::ChargingPoint, "ALC1").await);
}
