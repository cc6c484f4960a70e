/// Live event transport
///
/// `Transport` is the outbound half the synchronizer talks to. `TcpTransport`
/// carries newline-delimited JSON events over TCP, reconnects with a capped
/// exponential backoff and re-announces the user (`join`) on every connect.
/// Outbound events emitted while disconnected are buffered and flushed on the
/// next connection.
use crate::config::ReconnectPolicy;
use crate::error::{Result, SyncError};
use crate::protocol::{self, InboundEvent, OutboundEvent};
use crate::types::UserId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Capacity of the inbound event channel
const INBOUND_BUFFER: usize = 1024;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue an event for the server
    async fn emit(&self, event: OutboundEvent) -> Result<()>;

    /// Stop reconnecting and drop the connection
    fn close(&self) {}
}

/// Connection state of the live stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Attempting to connect
    Connecting,
    /// Connected and joined
    Connected,
    /// Waiting before the next attempt
    Disconnected,
    /// Closed by us or out of attempts
    Closed,
}

/// Why a connection ended
enum Closed {
    /// Shutdown requested, or every handle dropped
    Stop,
    /// Server went away; reconnect
    Lost(SyncError),
}

pub struct TcpTransport {
    outbound: mpsc::UnboundedSender<OutboundEvent>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
}

impl TcpTransport {
    /// Spawn the connection task. Inbound events arrive on the returned
    /// receiver in delivery order; it closes once the transport gives up.
    pub fn connect(
        addr: impl Into<String>,
        user: UserId,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::Receiver<InboundEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = ConnectionTask {
            addr: addr.into(),
            user,
            policy,
            outbound: outbound_rx,
            inbound: inbound_tx,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        tokio::spawn(task.run());

        (
            Self {
                outbound: outbound_tx,
                state: state_rx,
                shutdown: shutdown_tx,
            },
            inbound_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver for connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn emit(&self, event: OutboundEvent) -> Result<()> {
        self.outbound
            .send(event)
            .map_err(|e| SyncError::Transport(format!("transport closed, dropped {}", e.0)))
    }

    fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

struct ConnectionTask {
    addr: String,
    user: UserId,
    policy: ReconnectPolicy,
    outbound: mpsc::UnboundedReceiver<OutboundEvent>,
    inbound: mpsc::Sender<InboundEvent>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let _ = self.state.send(ConnectionState::Connecting);
            match timeout(self.policy.connect_timeout, TcpStream::connect(&self.addr)).await {
                Ok(Ok(stream)) => {
                    info!("Connected to {}", self.addr);
                    attempt = 0;
                    match self.serve(stream).await {
                        Closed::Stop => break,
                        Closed::Lost(e) => warn!("Connection to {} lost: {}", self.addr, e),
                    }
                }
                Ok(Err(e)) => {
                    warn!("Failed to connect to {}: {}", self.addr, e);
                }
                Err(_) => {
                    warn!("Connection timeout to {}", self.addr);
                }
            }

            let _ = self.state.send(ConnectionState::Disconnected);
            attempt += 1;
            let Some(delay) = self.policy.delay_for(attempt) else {
                error!(
                    "Giving up on {} after {} attempts",
                    self.addr, self.policy.max_attempts
                );
                break;
            };
            debug!("Reconnecting to {} in {:?} (attempt {})", self.addr, delay, attempt);

            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.changed() => {}
            }
        }

        let _ = self.state.send(ConnectionState::Closed);
        debug!("Transport task for {} stopped", self.addr);
    }

    /// Run one connection until it drops or we are told to stop
    async fn serve(&mut self, stream: TcpStream) -> Closed {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let join = OutboundEvent::Join(self.user.clone());
        if let Err(e) = write_event(&mut writer, &join).await {
            return Closed::Lost(e);
        }
        let _ = self.state.send(ConnectionState::Connected);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            return Closed::Lost(SyncError::Transport("closed by server".to_string()))
                        }
                        Err(e) => return Closed::Lost(SyncError::Io(e)),
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match InboundEvent::from_bytes(line.as_bytes()) {
                        Ok(event) => {
                            debug!("Received {}", event);
                            if self.inbound.send(event).await.is_err() {
                                return Closed::Stop;
                            }
                        }
                        Err(e) => match protocol::unhandled_event_name(line.as_bytes()) {
                            Some(name) => debug!("Skipping unhandled event '{}'", name),
                            None => warn!("Skipping malformed event: {}", e),
                        },
                    }
                }
                event = self.outbound.recv() => {
                    let Some(event) = event else {
                        return Closed::Stop;
                    };
                    if let Err(e) = write_event(&mut writer, &event).await {
                        warn!("Dropped {} on broken connection", event);
                        return Closed::Lost(e);
                    }
                }
                _ = self.shutdown.changed() => {
                    return Closed::Stop;
                }
            }
        }
    }
}

async fn write_event(writer: &mut tokio::net::tcp::OwnedWriteHalf, event: &OutboundEvent) -> Result<()> {
    let mut line = event.to_bytes()?;
    line.push(b'\n');
    writer.write_all(&line).await.map_err(SyncError::Io)?;
    Ok(())
}
