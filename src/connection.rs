//! Framed duplex transport with explicit flow control.
//!
//! Each connection owns a reader task and a writer task over the split TCP
//! stream. Frames are u32-length-prefixed; inbound frames are delivered in
//! chunks with a `remaining_in_frame` countdown so consumers accumulate
//! before parsing. All three event edges flow through a single queue, so
//! handlers for one connection never run concurrently with themselves.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::error::Result;

/// Event edges emitted by a [`Connection`].
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A fragment of an inbound frame. `remaining_in_frame > 0` means more
    /// fragments of the same logical message are still to arrive.
    DataReceived {
        bytes: Bytes,
        remaining_in_frame: usize,
    },
    /// An enqueued frame was handed to the OS (or failed).
    WriteAcknowledged { success: bool },
    /// The transport terminated; emitted exactly once.
    Disconnected { raw_id: u64 },
}

pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

struct Shared {
    raw_id: u64,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl Shared {
    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.close_tx.send(true);
            let _ = self.events_tx.send(ConnectionEvent::Disconnected {
                raw_id: self.raw_id,
            });
        }
    }
}

/// Single-owner handle to one framed transport.
///
/// Ownership moves from the handshake that accepts the connection into the
/// established channel on success; dropping the handle tears the transport
/// down.
pub struct Connection {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Bytes>,
    gate_tx: watch::Sender<bool>,
    peer_addr: SocketAddr,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("raw_id", &self.shared.raw_id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl Connection {
    /// Takes ownership of an established stream and spawns its I/O tasks.
    pub fn spawn(
        stream: TcpStream,
        raw_id: u64,
        max_frame_size: usize,
        read_chunk_size: usize,
    ) -> Result<(Self, EventReceiver)> {
        let peer_addr = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let (gate_tx, gate_rx) = watch::channel(true);

        let shared = Arc::new(Shared {
            raw_id,
            events_tx,
            closed: AtomicBool::new(false),
            close_tx,
        });

        let reader = FramedRead::new(
            read_half,
            LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_size)
                .new_codec(),
        );
        let writer = FramedWrite::new(
            write_half,
            LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_size)
                .new_codec(),
        );

        tokio::spawn(reader_task(
            reader,
            Arc::clone(&shared),
            close_rx.clone(),
            gate_rx,
            read_chunk_size,
        ));
        tokio::spawn(writer_task(
            writer,
            outbound_rx,
            Arc::clone(&shared),
            close_rx,
            max_frame_size,
        ));

        Ok((
            Self {
                shared,
                outbound: outbound_tx,
                gate_tx,
                peer_addr,
            },
            events_rx,
        ))
    }

    /// Enqueues one frame; returns immediately. A write-acknowledged event
    /// follows once the frame has been handed to the OS or has failed.
    pub fn send(&self, frame: Bytes) {
        if self.shared.closed.load(Ordering::SeqCst) || self.outbound.send(frame).is_err() {
            let _ = self
                .shared
                .events_tx
                .send(ConnectionEvent::WriteAcknowledged { success: false });
        }
    }

    /// Resumes delivery of data-received events.
    pub fn enable_events(&self) {
        let _ = self.gate_tx.send(true);
    }

    /// Suppresses data-received events; inbound bytes wait at the reader.
    pub fn disable_events(&self) {
        let _ = self.gate_tx.send(false);
    }

    /// Terminates the transport. Idempotent; the disconnected event fires
    /// exactly once.
    pub fn disconnect(&self) {
        self.shared.mark_closed();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn raw_id(&self) -> u64 {
        self.shared.raw_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.mark_closed();
    }
}

async fn reader_task(
    mut source: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    shared: Arc<Shared>,
    mut close_rx: watch::Receiver<bool>,
    mut gate_rx: watch::Receiver<bool>,
    read_chunk_size: usize,
) {
    'outer: loop {
        tokio::select! {
            _ = close_rx.changed() => break,
            frame = source.next() => {
                let mut frame: BytesMut = match frame {
                    None => {
                        debug!(target: "syncnet::connection", id = shared.raw_id, "peer closed the stream");
                        shared.mark_closed();
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(target: "syncnet::connection", id = shared.raw_id, error = %e, "inbound frame rejected");
                        shared.mark_closed();
                        break;
                    }
                    Some(Ok(frame)) => frame,
                };
                let total = frame.len();
                let mut delivered = 0;
                loop {
                    while !*gate_rx.borrow() {
                        tokio::select! {
                            _ = close_rx.changed() => break 'outer,
                            changed = gate_rx.changed() => {
                                if changed.is_err() {
                                    break 'outer;
                                }
                            }
                        }
                    }
                    let take = read_chunk_size.min(frame.len());
                    let chunk = frame.split_to(take).freeze();
                    delivered += take;
                    let event = ConnectionEvent::DataReceived {
                        bytes: chunk,
                        remaining_in_frame: total - delivered,
                    };
                    if shared.events_tx.send(event).is_err() {
                        break 'outer;
                    }
                    if frame.is_empty() {
                        break;
                    }
                }
            }
        }
    }
}

async fn writer_task(
    mut sink: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
    mut close_rx: watch::Receiver<bool>,
    max_frame_size: usize,
) {
    loop {
        tokio::select! {
            _ = close_rx.changed() => break,
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if frame.len() > max_frame_size {
                    warn!(
                        target: "syncnet::connection",
                        id = shared.raw_id,
                        size = frame.len(),
                        limit = max_frame_size,
                        "outbound frame exceeds the configured maximum"
                    );
                    let _ = shared
                        .events_tx
                        .send(ConnectionEvent::WriteAcknowledged { success: false });
                    shared.mark_closed();
                    break;
                }
                match sink.send(frame).await {
                    Ok(()) => {
                        let _ = shared
                            .events_tx
                            .send(ConnectionEvent::WriteAcknowledged { success: true });
                    }
                    Err(e) => {
                        warn!(target: "syncnet::connection", id = shared.raw_id, error = %e, "write failed");
                        let _ = shared
                            .events_tx
                            .send(ConnectionEvent::WriteAcknowledged { success: false });
                        shared.mark_closed();
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair(max: usize, chunk: usize) -> ((Connection, EventReceiver), (Connection, EventReceiver)) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        let dialed = dialer.await.unwrap();
        (
            Connection::spawn(dialed, 1, max, chunk).unwrap(),
            Connection::spawn(accepted, 2, max, chunk).unwrap(),
        )
    }

    async fn collect_frame(events: &mut EventReceiver) -> Vec<u8> {
        let mut assembled = Vec::new();
        loop {
            match events.recv().await.expect("event stream open") {
                ConnectionEvent::DataReceived {
                    bytes,
                    remaining_in_frame,
                } => {
                    assembled.extend_from_slice(&bytes);
                    if remaining_in_frame == 0 {
                        return assembled;
                    }
                }
                ConnectionEvent::WriteAcknowledged { .. } => continue,
                ConnectionEvent::Disconnected { .. } => panic!("unexpected disconnect"),
            }
        }
    }

    #[tokio::test]
    async fn frame_roundtrip_with_fragmentation() {
        let ((alpha, mut alpha_events), (_beta, mut beta_events)) = pair(1 << 20, 8).await;
        alpha.send(Bytes::from_static(b"twenty-four byte payload"));
        match alpha_events.recv().await.unwrap() {
            ConnectionEvent::WriteAcknowledged { success } => assert!(success),
            other => panic!("expected ack, got {other:?}"),
        }
        let frame = collect_frame(&mut beta_events).await;
        assert_eq!(frame, b"twenty-four byte payload");
    }

    #[tokio::test]
    async fn oversize_send_fails_and_disconnects() {
        let ((alpha, mut alpha_events), _beta) = pair(16, 8).await;
        alpha.send(Bytes::from(vec![0_u8; 17]));
        let mut saw_failed_ack = false;
        let mut saw_disconnect = false;
        while let Some(event) = alpha_events.recv().await {
            match event {
                ConnectionEvent::WriteAcknowledged { success } => saw_failed_ack = !success,
                ConnectionEvent::Disconnected { raw_id } => {
                    assert_eq!(raw_id, 1);
                    saw_disconnect = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_failed_ack && saw_disconnect);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let ((alpha, mut alpha_events), _beta) = pair(1024, 64).await;
        alpha.disconnect();
        alpha.disconnect();
        // Dropping the handle releases the last event sender once the I/O
        // tasks exit, so the stream terminates after the single disconnect.
        drop(alpha);
        let mut disconnects = 0;
        while let Some(event) = alpha_events.recv().await {
            if let ConnectionEvent::Disconnected { .. } = event {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn gated_events_hold_delivery() {
        let ((alpha, _alpha_events), (beta, mut beta_events)) = pair(1024, 64).await;
        beta.disable_events();
        alpha.send(Bytes::from_static(b"held"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(beta_events.try_recv().is_err());
        beta.enable_events();
        let frame = collect_frame(&mut beta_events).await;
        assert_eq!(frame, b"held");
    }
}
