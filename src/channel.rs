//! Established command and data channels.
//!
//! A channel owns the post-handshake connection, the bound symmetric
//! handler, the queue of in-flight outbound frames awaiting write
//! acknowledgement, and, for command channels, the map of pending
//! instructions keyed by command id. Outbound buffers move into the
//! in-flight queue on send and out on acknowledgement; teardown drops the
//! queue whole.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::codec::{Instruction, InstructionResult};
use crate::connection::Connection;
use crate::crypto::SymmetricHandler;
use crate::error::{NetError, Result};
use crate::messages::{CommandId, ConnectionId, DeviceId, TransientConnectionId};

/// Channel family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Command,
    Data,
}

/// An instruction whose request has been written and whose response is due.
pub struct PendingCommand {
    pub instruction: Instruction,
    pub responder: oneshot::Sender<Result<InstructionResult>>,
}

/// Live channel promoted from a completed handshake.
pub struct EstablishedChannel {
    device_id: DeviceId,
    connection_id: ConnectionId,
    transient_id: Option<TransientConnectionId>,
    kind: ChannelKind,
    connection: Connection,
    handler: SymmetricHandler,
    encrypt: bool,
    compress: bool,
    max_data_size: usize,
    last_command_id: AtomicU64,
    event_counter: AtomicU64,
    in_flight: Mutex<VecDeque<Bytes>>,
    pending: Mutex<HashMap<CommandId, PendingCommand>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for EstablishedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedChannel")
            .field("device_id", &self.device_id)
            .field("connection_id", &self.connection_id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl EstablishedChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: DeviceId,
        connection_id: ConnectionId,
        transient_id: Option<TransientConnectionId>,
        kind: ChannelKind,
        connection: Connection,
        handler: SymmetricHandler,
        encrypt: bool,
        compress: bool,
        max_data_size: usize,
    ) -> Self {
        Self {
            device_id,
            connection_id,
            transient_id,
            kind,
            connection,
            handler,
            encrypt,
            compress,
            max_data_size,
            last_command_id: AtomicU64::new(0),
            event_counter: AtomicU64::new(0),
            in_flight: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn transient_id(&self) -> Option<TransientConnectionId> {
        self.transient_id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Protects a payload for the wire: compress, then seal.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Bytes> {
        let body = if self.compress {
            deflate(plaintext)?
        } else {
            plaintext.to_vec()
        };
        let framed = if self.encrypt {
            self.handler.encrypt(&body)?
        } else {
            body
        };
        Ok(Bytes::from(framed))
    }

    /// Reverses [`Self::seal`] for an assembled inbound frame.
    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let body = if self.encrypt {
            self.handler.decrypt(frame)?
        } else {
            frame.to_vec()
        };
        if self.compress {
            inflate(&body, self.max_data_size)
        } else {
            Ok(body)
        }
    }

    /// Seals and enqueues a payload; the buffer stays in the in-flight queue
    /// until its write acknowledgement arrives.
    pub fn send_payload(&self, plaintext: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetError::ChannelClosed("channel is closed".into()));
        }
        let frame = self.seal(plaintext)?;
        self.in_flight.lock().push_back(frame.clone());
        self.connection.send(frame);
        Ok(())
    }

    /// Consumes the oldest in-flight buffer after a write acknowledgement.
    pub fn acknowledge_write(&self) -> Option<Bytes> {
        self.in_flight.lock().pop_front()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn next_command_id(&self) -> CommandId {
        self.last_command_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn bump_event_counter(&self) {
        self.event_counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Snapshot used by the inactivity timer.
    pub fn event_count(&self) -> u64 {
        self.event_counter.load(Ordering::SeqCst)
    }

    pub fn register_pending(&self, command_id: CommandId, pending: PendingCommand) {
        self.pending.lock().insert(command_id, pending);
    }

    pub fn take_pending(&self, command_id: CommandId) -> Option<PendingCommand> {
        self.pending.lock().remove(&command_id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Marks the channel closed; the first caller drains the outstanding
    /// state. Returns `false` on repeat calls.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tears the transport down and completes every pending instruction with
    /// a channel-closed error. The in-flight queue is dropped whole.
    pub fn teardown(&self) {
        self.connection.disconnect();
        self.in_flight.lock().clear();
        let drained: Vec<(CommandId, PendingCommand)> = self.pending.lock().drain().collect();
        for (command_id, pending) in drained {
            let _ = pending.responder.send(Err(NetError::ChannelClosed(format!(
                "channel closed before response to command [{command_id}]"
            ))));
        }
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn inflate(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data).take(limit as u64 + 1);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(NetError::ResourceExceeded {
            size: out.len(),
            limit,
        });
    }
    Ok(out)
}
