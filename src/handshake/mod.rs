//! Handshake state machines and their shared plumbing.
//!
//! Each handshake borrows the narrow [`HandshakeServices`] seam instead of a
//! back-pointer to the coordinator, owns the connection for its duration,
//! and either hands it over on success or tears it down on failure.

pub mod command;
pub mod data;
pub mod init;

use tracing::warn;

use crate::connection::{Connection, ConnectionEvent, EventReceiver};
use crate::crypto::{CryptoService, LocalIdentity, SymmetricHandler};
use crate::config::NetworkConfig;
use crate::device::{AuthenticationStore, DeviceDirectory};
use crate::error::{NetError, Result};
use crate::messages::{DeviceId, TransientConnectionId};
use crate::store::{ConnectionDataStore, Endpoint};

/// Per-connection handshake state.
///
/// Transitions are monotonic; the only legal regression is to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Initiated,
    RequestSent,
    RequestAcknowledged,
    ResponseReceived,
    ResponseSent,
    Completed,
    Failed,
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl HandshakeState {
    /// Applies a transition, rejecting anything not in the two legal paths.
    pub fn advance(self, next: HandshakeState) -> Result<HandshakeState> {
        use HandshakeState::*;
        let legal = matches!(
            (self, next),
            (Initiated, RequestSent)
                | (Initiated, ResponseSent)
                | (RequestSent, RequestAcknowledged)
                | (RequestAcknowledged, ResponseReceived)
                | (ResponseReceived, Completed)
                | (ResponseSent, Completed)
        ) || (next == Failed && !matches!(self, Completed | Failed));
        if legal {
            Ok(next)
        } else {
            Err(NetError::Protocol(format!(
                "illegal handshake transition {self} -> {next}"
            )))
        }
    }
}

/// Local listening endpoints advertised during pairing.
#[derive(Debug, Clone, Default)]
pub struct LocalEndpoints {
    pub command: Endpoint,
    pub data: Endpoint,
    pub init: Endpoint,
}

/// The only operations handshakes may perform against the rest of the node.
pub trait HandshakeServices: Send + Sync {
    fn crypto(&self) -> &CryptoService;
    fn local_identity(&self) -> &LocalIdentity;
    fn directory(&self) -> &dyn DeviceDirectory;
    fn authentication(&self) -> &dyn AuthenticationStore;
    fn connection_store(&self) -> &ConnectionDataStore;
    fn network_config(&self) -> &NetworkConfig;
    fn local_endpoints(&self) -> LocalEndpoints;
}

/// Result of a successful command or data handshake, ready for promotion
/// into an established channel.
#[derive(Debug)]
pub struct HandshakeSuccess {
    pub device_id: DeviceId,
    pub transient_id: Option<TransientConnectionId>,
    pub connection: Connection,
    pub events: EventReceiver,
    pub handler: SymmetricHandler,
    pub encrypt: bool,
    pub compress: bool,
}

/// Terminal failure report; `state` is always [`HandshakeState::Failed`].
#[derive(Debug)]
pub struct HandshakeFailure {
    pub error: NetError,
    pub state: HandshakeState,
}

/// Event-loop access to the connection owned by a handshake.
///
/// The strict accessors enforce the ordering rules: a frame arriving while a
/// write acknowledgement is due is a protocol violation, not data.
pub struct HandshakeIo {
    connection: Connection,
    events: EventReceiver,
}

impl HandshakeIo {
    pub fn new(connection: Connection, events: EventReceiver) -> Self {
        Self { connection, events }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn send(&self, frame: Vec<u8>) {
        self.connection.send(frame.into());
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Waits for the acknowledgement of the last sent frame.
    pub async fn await_write_ack(&mut self) -> Result<()> {
        match self.events.recv().await {
            None => Err(NetError::ChannelClosed("event stream ended".into())),
            Some(ConnectionEvent::WriteAcknowledged { success: true }) => Ok(()),
            Some(ConnectionEvent::WriteAcknowledged { success: false }) => {
                Err(NetError::ChannelClosed("write not acknowledged".into()))
            }
            Some(ConnectionEvent::DataReceived { .. }) => Err(NetError::Protocol(
                "data received before the write was acknowledged".into(),
            )),
            Some(ConnectionEvent::Disconnected { .. }) => {
                Err(NetError::ChannelClosed("peer disconnected".into()))
            }
        }
    }

    /// Accumulates fragments until a whole frame is available.
    pub async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        let mut assembled: Vec<u8> = Vec::new();
        loop {
            match self.events.recv().await {
                None => return Err(NetError::ChannelClosed("event stream ended".into())),
                Some(ConnectionEvent::DataReceived {
                    bytes,
                    remaining_in_frame,
                }) => {
                    assembled.extend_from_slice(&bytes);
                    if remaining_in_frame == 0 {
                        return Ok(assembled);
                    }
                }
                Some(ConnectionEvent::WriteAcknowledged { success: false }) => {
                    return Err(NetError::ChannelClosed("write not acknowledged".into()))
                }
                Some(ConnectionEvent::WriteAcknowledged { success: true }) => {
                    return Err(NetError::Protocol(
                        "unexpected write acknowledgement while awaiting a frame".into(),
                    ))
                }
                Some(ConnectionEvent::Disconnected { .. }) => {
                    return Err(NetError::ChannelClosed("peer disconnected".into()))
                }
            }
        }
    }

    pub fn into_parts(self) -> (Connection, EventReceiver) {
        (self.connection, self.events)
    }
}

pub(crate) fn log_handshake_failure(kind: &str, state: HandshakeState, error: &NetError) {
    warn!(
        target: "syncnet::handshake",
        kind,
        %state,
        %error,
        "handshake failed"
    );
}

#[cfg(test)]
mod tests {
    use super::HandshakeState::*;

    #[test]
    fn initiator_path_is_legal() {
        let mut state = Initiated;
        for next in [RequestSent, RequestAcknowledged, ResponseReceived, Completed] {
            state = state.advance(next).unwrap();
        }
        assert_eq!(state, Completed);
    }

    #[test]
    fn acceptor_path_is_legal() {
        let state = Initiated.advance(ResponseSent).unwrap();
        assert_eq!(state.advance(Completed).unwrap(), Completed);
    }

    #[test]
    fn regression_only_to_failed() {
        assert!(RequestAcknowledged.advance(RequestSent).is_err());
        assert!(RequestAcknowledged.advance(Failed).is_ok());
        assert!(Completed.advance(Failed).is_err());
        assert!(Failed.advance(Failed).is_err());
    }

    #[test]
    fn skipping_ahead_is_rejected() {
        assert!(Initiated.advance(Completed).is_err());
        assert!(RequestSent.advance(ResponseReceived).is_err());
    }
}
