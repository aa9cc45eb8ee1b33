//! Truck / device TCP server
//!
//! Newline-delimited JSON. Each connection gets a reader (this task), a
//! writer draining the session outbox and a worker that routes the peer's
//! messages in arrival order. Emergency-class messages are routed straight
//! from the reader so they never wait behind queued work.

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::codec::{CodecError, Message};
use crate::command_types::OutboundCommand;
use crate::dispatcher::CommandDispatcher;
use crate::router::{is_emergency, MessageRouter};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// TCP front end for trucks and plant devices
pub struct FleetServer {
    router: Arc<MessageRouter>,
    dispatcher: Arc<CommandDispatcher>,
    listen_addr: String,
}

impl FleetServer {
    /// Create a server that will listen on `listen_addr`
    pub fn new(router: Arc<MessageRouter>, dispatcher: Arc<CommandDispatcher>, listen_addr: impl Into<String>) -> Self {
        Self {
            router,
            dispatcher,
            listen_addr: listen_addr.into(),
        }
    }

    /// Bind the configured address and serve forever
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        info!(addr = %listener.local_addr()?, "Fleet server listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "Connection accepted");
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer_addr).await {
                            warn!(peer_addr = %peer_addr, error = %e, "Connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<(), ServerError> {
        let (reader, mut writer) = stream.into_split();

        let (outbox, mut outgoing) = mpsc::unbounded_channel::<Message>();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = outgoing.recv().await {
                let line = match message.encode() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Outbound message not encodable");
                        continue;
                    }
                };
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let (work, mut queued) = mpsc::unbounded_channel::<Message>();
        let router = self.router.clone();
        let worker = tokio::spawn(async move {
            while let Some(message) = queued.recv().await {
                let (sender, cmd) = (message.sender.clone(), message.cmd.clone());
                let outcome = router.route(message).await;
                debug!(sender = %sender, cmd = %cmd, ?outcome, "Message routed");
            }
        });

        let mut session: Option<(String, u64)> = None;
        let mut lines = BufReader::new(reader).lines();
        let read_result = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            let message = match Message::decode(&line) {
                Ok(message) => message,
                Err(CodecError::Empty) => continue,
                Err(e) => {
                    warn!(peer_addr = %peer_addr, error = %e, "Malformed frame dropped");
                    continue;
                }
            };

            if message.cmd == "HELLO" {
                if session.is_none() {
                    let session_id = self.dispatcher.register(&message.sender, outbox.clone());
                    session = Some((message.sender.clone(), session_id));
                    let ack = Message::new(self.dispatcher.server_id(), message.sender.as_str(), OutboundCommand::Ack.as_str())
                        .with("status", "CONNECTED");
                    let _ = outbox.send(ack);
                } else {
                    debug!(peer_addr = %peer_addr, sender = %message.sender, "Repeated HELLO on bound connection");
                }
            }

            if is_emergency(&message) {
                let outcome = self.router.route(message).await;
                debug!(peer_addr = %peer_addr, ?outcome, "Emergency routed");
                continue;
            }

            if work.send(message).is_err() {
                break Ok(());
            }
        };

        drop(work);
        let _ = worker.await;

        if let Some((peer_id, session_id)) = session {
            self.dispatcher.unregister(&peer_id, session_id);
            info!(peer_id = %peer_id, peer_addr = %peer_addr, "Peer disconnected");
        }
        drop(outbox);
        let _ = writer_task.await;

        read_result.map_err(ServerError::from)
    }
}
