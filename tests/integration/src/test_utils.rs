//! Test utilities for end-to-end dispatcher tests

use fleetloop_c2_router::{CommandDispatcher, FleetApp, Message};
use fleetloop_core::{FleetConfig, FleetStore, SqliteStore};
use fleetloop_facility::SimulatedLink;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// How long a client waits for one line before failing the test
pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Route test logs through the test harness writer
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Configuration with timeouts short enough for tests
pub fn test_config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.server.listen_addr = "127.0.0.1:0".to_string();
    config.timing.gate_timeout_ms = 200;
    config.timing.belt_timeout_ms = 200;
    config.timing.dispenser_timeout_ms = 200;
    config.timing.retry_attempts = 2;
    config.timing.retry_backoff_ms = 5;
    config.timing.busy_retry_attempts = 20;
    config.timing.busy_retry_backoff_ms = 10;
    config.timing.loading_safety_timeout_ms = 10_000;
    config.timing.dedup_window_ms = 500;
    config
}

/// A dispatcher wired to an inspectable hardware simulator
pub struct TestFleet {
    /// Assembled application
    pub app: FleetApp,
    /// Simulator standing in for gates, belt and dispenser
    pub link: Arc<SimulatedLink>,
    /// Backing store
    pub store: Arc<dyn FleetStore>,
}

impl TestFleet {
    /// Fresh in-memory fleet; the dispenser finishes after `load_delay`
    pub fn start(load_delay: Duration) -> Self {
        let store: Arc<dyn FleetStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        Self::with_store(test_config(), store, load_delay)
    }

    /// Fleet over an existing store
    pub fn with_store(config: FleetConfig, store: Arc<dyn FleetStore>, load_delay: Duration) -> Self {
        init_tracing();
        let (link, signals) = SimulatedLink::new(Duration::from_millis(5), load_delay);
        let link = Arc::new(link);
        let dispatcher = Arc::new(CommandDispatcher::new(config.server.server_id.clone()));
        let app = FleetApp::new(config, store.clone(), dispatcher, link.clone());
        app.spawn_device_pump(signals);
        Self { app, link, store }
    }

    /// Serve the fleet on an ephemeral local port
    pub async fn serve(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = self.app.server();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        addr
    }
}

/// A truck or device speaking newline-delimited JSON
pub struct TestClient {
    id: String,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    /// Connect and announce `id`; waits for the CONNECTED acknowledgment
    pub async fn connect(addr: SocketAddr, id: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            id: id.to_string(),
            lines: BufReader::new(reader).lines(),
            writer,
        };
        client.send(client.message("HELLO")).await;
        let ack = client.recv().await;
        assert_eq!(ack.cmd, "ACK");
        assert_eq!(ack.payload_str("status"), Some("CONNECTED"));
        client
    }

    /// Message from this client to the server
    pub fn message(&self, cmd: &str) -> Message {
        Message::new(self.id.as_str(), "SERVER", cmd)
    }

    /// Write one message
    pub async fn send(&mut self, message: Message) {
        let line = message.encode().unwrap();
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    /// Write bytes as-is
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// Write a bare command
    pub async fn send_cmd(&mut self, cmd: &str) {
        let message = self.message(cmd);
        self.send(message).await;
    }

    /// Read the next message, failing after [`RECV_TIMEOUT`]
    pub async fn recv(&mut self) -> Message {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .unwrap_or_else(|_| panic!("{} timed out waiting for a message", self.id))
            .unwrap()
            .unwrap_or_else(|| panic!("{} connection closed", self.id));
        Message::decode(&line).unwrap()
    }

    /// Read until `cmd` arrives; returns every command seen, `cmd` last
    pub async fn recv_until(&mut self, cmd: &str) -> Vec<Message> {
        let mut seen = Vec::new();
        loop {
            let message = self.recv().await;
            let done = message.cmd == cmd;
            seen.push(message);
            if done {
                return seen;
            }
        }
    }

    /// Assert nothing arrives for `quiet`
    pub async fn expect_silence(&mut self, quiet: Duration) {
        if let Ok(Ok(Some(line))) = tokio::time::timeout(quiet, self.lines.next_line()).await {
            panic!("{} expected silence, got {line}", self.id);
        }
    }
}

/// Poll `check` until it holds or `RECV_TIMEOUT` elapses
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Commands in arrival order
pub fn cmds(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.cmd.as_str()).collect()
}
