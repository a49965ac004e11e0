//! Connection managers: one listening endpoint plus outbound dials.
//!
//! A manager produces raw connections and never interprets bytes; the
//! coordinator decides which handshake to run based on the manager's role
//! and the connection origin.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::connection::{Connection, EventReceiver};
use crate::error::{NetError, Result};

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOrigin {
    Local,
    Remote,
}

/// Handshake family served by a manager's endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerRole {
    Init,
    Command,
    Data,
}

/// Events surfaced to the coordinator.
#[derive(Debug)]
pub enum ManagerEvent {
    ConnectionCreated {
        connection: Connection,
        events: EventReceiver,
        origin: ConnectionOrigin,
    },
    InitiationFailed {
        peer: String,
        error: NetError,
    },
}

/// Owns one listener and the dial attempts targeted at remote peers.
pub struct ConnectionManager {
    role: ManagerRole,
    local_addr: SocketAddr,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    next_raw_id: Arc<AtomicU64>,
    max_frame_size: usize,
    read_chunk_size: usize,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("role", &self.role)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl ConnectionManager {
    /// Binds the listener and spawns the accept loop.
    pub async fn start(
        listen_addr: &str,
        listen_port: u16,
        role: ManagerRole,
        next_raw_id: Arc<AtomicU64>,
        max_frame_size: usize,
        read_chunk_size: usize,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ManagerEvent>)> {
        let listener = TcpListener::bind((listen_addr, listen_port)).await?;
        let local_addr = listener.local_addr()?;
        info!(target: "syncnet::manager", ?role, %local_addr, "listening");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let manager = Self {
            role,
            local_addr,
            events_tx: events_tx.clone(),
            next_raw_id: Arc::clone(&next_raw_id),
            max_frame_size,
            read_chunk_size,
            shutdown_tx,
        };

        tokio::spawn(accept_loop(
            listener,
            events_tx,
            next_raw_id,
            max_frame_size,
            read_chunk_size,
            shutdown_rx,
        ));

        Ok((manager, events_rx))
    }

    /// Initiates an outbound TCP connection; completion is reported through
    /// the manager's event stream.
    pub fn dial(&self, remote_addr: &str, remote_port: u16) {
        let target = format!("{remote_addr}:{remote_port}");
        let events_tx = self.events_tx.clone();
        let next_raw_id = Arc::clone(&self.next_raw_id);
        let max_frame_size = self.max_frame_size;
        let read_chunk_size = self.read_chunk_size;
        tokio::spawn(async move {
            match TcpStream::connect(&target).await {
                Ok(stream) => {
                    let raw_id = next_raw_id.fetch_add(1, Ordering::SeqCst);
                    match Connection::spawn(stream, raw_id, max_frame_size, read_chunk_size) {
                        Ok((connection, events)) => {
                            debug!(target: "syncnet::manager", %target, raw_id, "dialed");
                            let _ = events_tx.send(ManagerEvent::ConnectionCreated {
                                connection,
                                events,
                                origin: ConnectionOrigin::Local,
                            });
                        }
                        Err(error) => {
                            let _ = events_tx.send(ManagerEvent::InitiationFailed {
                                peer: target,
                                error,
                            });
                        }
                    }
                }
                Err(e) => {
                    warn!(target: "syncnet::manager", %target, error = %e, "dial failed");
                    let _ = events_tx.send(ManagerEvent::InitiationFailed {
                        peer: target,
                        error: NetError::Io(e),
                    });
                }
            }
        });
    }

    pub fn role(&self) -> ManagerRole {
        self.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the accept loop. Existing connections are unaffected.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    next_raw_id: Arc<AtomicU64>,
    max_frame_size: usize,
    read_chunk_size: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let raw_id = next_raw_id.fetch_add(1, Ordering::SeqCst);
                    match Connection::spawn(stream, raw_id, max_frame_size, read_chunk_size) {
                        Ok((connection, events)) => {
                            debug!(target: "syncnet::manager", %peer, raw_id, "accepted");
                            if events_tx
                                .send(ManagerEvent::ConnectionCreated {
                                    connection,
                                    events,
                                    origin: ConnectionOrigin::Remote,
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(error) => {
                            warn!(target: "syncnet::manager", %peer, %error, "accepted socket unusable");
                        }
                    }
                }
                Err(e) => {
                    warn!(target: "syncnet::manager", error = %e, "accept failed");
                }
            }
        }
    }
    debug!(target: "syncnet::manager", "accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_and_dial_produce_paired_connections() {
        let ids = Arc::new(AtomicU64::new(1));
        let (listener_side, mut listener_events) =
            ConnectionManager::start("127.0.0.1", 0, ManagerRole::Command, Arc::clone(&ids), 1024, 64)
                .await
                .unwrap();
        let (dialer_side, mut dialer_events) =
            ConnectionManager::start("127.0.0.1", 0, ManagerRole::Command, ids, 1024, 64)
                .await
                .unwrap();

        let addr = listener_side.local_addr();
        dialer_side.dial(&addr.ip().to_string(), addr.port());

        match dialer_events.recv().await.unwrap() {
            ManagerEvent::ConnectionCreated { origin, .. } => {
                assert_eq!(origin, ConnectionOrigin::Local);
            }
            other => panic!("expected local connection, got {other:?}"),
        }
        match listener_events.recv().await.unwrap() {
            ManagerEvent::ConnectionCreated { origin, .. } => {
                assert_eq!(origin, ConnectionOrigin::Remote);
            }
            other => panic!("expected remote connection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_dial_reports_initiation_failure() {
        let ids = Arc::new(AtomicU64::new(1));
        let (manager, mut events) =
            ConnectionManager::start("127.0.0.1", 0, ManagerRole::Init, ids, 1024, 64)
                .await
                .unwrap();
        // Port 1 on localhost is assumed closed.
        manager.dial("127.0.0.1", 1);
        match events.recv().await.unwrap() {
            ManagerEvent::InitiationFailed { .. } => {}
            other => panic!("expected initiation failure, got {other:?}"),
        }
    }
}
