//! Network coordinator.
//!
//! Owns the connection managers, dispatches new connections to the matching
//! handshake, promotes completed handshakes into established channels,
//! routes command traffic to pending futures, and arms the setup,
//! inactivity, and discard timers. Long work happens outside every table
//! lock; locks are held only for the index operation itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelKind, EstablishedChannel, PendingCommand};
use crate::codec::{CommandCodec, Instruction, InstructionResult, ParsedCommand};
use crate::config::NetworkConfig;
use crate::connection::{ConnectionEvent, EventReceiver};
use crate::crypto::{CryptoService, LocalIdentity};
use crate::device::{AuthenticationStore, DeviceDirectory};
use crate::error::{NetError, Result};
use crate::handshake::command::CommandHandshake;
use crate::handshake::data::DataHandshake;
use crate::handshake::init::InitHandshake;
use crate::handshake::{HandshakeIo, HandshakeServices, LocalEndpoints};
use crate::manager::{ConnectionManager, ConnectionOrigin, ManagerEvent, ManagerRole};
use crate::messages::{ConnectionId, DeviceId, OpenDataConnectionBody, TransientConnectionId};
use crate::store::{ConnectionDataStore, PendingDataChannel, PendingInitSetup};
use crate::tokens::{AuthorizationToken, AuthorizationTokenStore};

/// Events surfaced to the embedder.
#[derive(Debug)]
pub enum CoordinatorEvent {
    PairingCompleted {
        device_id: DeviceId,
    },
    PairingFailed,
    ChannelEstablished {
        device_id: DeviceId,
        connection_id: ConnectionId,
        kind: ChannelKind,
        transient_id: Option<TransientConnectionId>,
    },
    ChannelClosed {
        device_id: DeviceId,
        connection_id: ConnectionId,
        kind: ChannelKind,
        transient_id: Option<TransientConnectionId>,
    },
    HandshakeFailed {
        connection_id: ConnectionId,
        transient_id: Option<TransientConnectionId>,
    },
    /// Application payload delivered over an established data channel.
    DataReceived {
        device_id: DeviceId,
        transient_id: TransientConnectionId,
        bytes: Vec<u8>,
    },
    InitiationFailed {
        peer: String,
    },
}

struct QueuedInstruction {
    instruction: Instruction,
    responder: oneshot::Sender<Result<InstructionResult>>,
}

struct Inner {
    config: NetworkConfig,
    crypto: CryptoService,
    local: LocalIdentity,
    directory: Arc<dyn DeviceDirectory>,
    auth: Arc<dyn AuthenticationStore>,
    store: ConnectionDataStore,
    tokens: AuthorizationTokenStore,
    codec: CommandCodec,
    connection_ids: Arc<AtomicU64>,
    endpoints: Mutex<LocalEndpoints>,
    managers: Mutex<HashMap<ManagerRole, ConnectionManager>>,
    command_channels: Mutex<HashMap<DeviceId, Arc<EstablishedChannel>>>,
    data_channels: Mutex<HashMap<(DeviceId, TransientConnectionId), Arc<EstablishedChannel>>>,
    pending_instructions: Mutex<HashMap<DeviceId, Vec<QueuedInstruction>>>,
    events_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    shutdown_tx: watch::Sender<bool>,
    shutdown: AtomicBool,
}

impl HandshakeServices for Inner {
    fn crypto(&self) -> &CryptoService {
        &self.crypto
    }

    fn local_identity(&self) -> &LocalIdentity {
        &self.local
    }

    fn directory(&self) -> &dyn DeviceDirectory {
        self.directory.as_ref()
    }

    fn authentication(&self) -> &dyn AuthenticationStore {
        self.auth.as_ref()
    }

    fn connection_store(&self) -> &ConnectionDataStore {
        &self.store
    }

    fn network_config(&self) -> &NetworkConfig {
        &self.config
    }

    fn local_endpoints(&self) -> LocalEndpoints {
        self.endpoints.lock().clone()
    }
}

/// Entry point of the connection core.
pub struct NetworkCoordinator {
    inner: Arc<Inner>,
}

impl NetworkCoordinator {
    pub fn new(
        config: NetworkConfig,
        crypto: CryptoService,
        local: LocalIdentity,
        directory: Arc<dyn DeviceDirectory>,
        auth: Arc<dyn AuthenticationStore>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CoordinatorEvent>)> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            config,
            crypto,
            local,
            directory,
            auth,
            store: ConnectionDataStore::new(),
            tokens: AuthorizationTokenStore::new(),
            codec: CommandCodec::new(),
            connection_ids: Arc::new(AtomicU64::new(1)),
            endpoints: Mutex::new(LocalEndpoints::default()),
            managers: Mutex::new(HashMap::new()),
            command_channels: Mutex::new(HashMap::new()),
            data_channels: Mutex::new(HashMap::new()),
            pending_instructions: Mutex::new(HashMap::new()),
            events_tx,
            shutdown_tx,
            shutdown: AtomicBool::new(false),
        });
        Ok((Self { inner }, events_rx))
    }

    /// Starts a connection manager for one handshake family and wires its
    /// event stream into the dispatcher. Returns the bound address.
    pub async fn attach_manager(
        &self,
        role: ManagerRole,
        listen_addr: &str,
        listen_port: u16,
    ) -> Result<SocketAddr> {
        let (manager, events) = ConnectionManager::start(
            listen_addr,
            listen_port,
            role,
            Arc::clone(&self.inner.connection_ids),
            self.inner.config.max_data_size,
            self.inner.config.read_chunk_size,
        )
        .await?;
        let bound = manager.local_addr();
        {
            let mut endpoints = self.inner.endpoints.lock();
            let entry = (bound.ip().to_string(), bound.port());
            match role {
                ManagerRole::Init => endpoints.init = entry,
                ManagerRole::Command => endpoints.command = entry,
                ManagerRole::Data => endpoints.data = entry,
            }
        }
        self.inner.managers.lock().insert(role, manager);
        tokio::spawn(manager_pump(Arc::clone(&self.inner), role, events));
        Ok(bound)
    }

    /// Issues a one-shot authorization token for a subsequent request.
    pub fn authorize(&self) -> AuthorizationToken {
        self.inner.tokens.issue()
    }

    /// Registers (and for the outbound case, dials) a pairing attempt.
    pub fn request_init_setup(
        &self,
        pending: PendingInitSetup,
        token: AuthorizationToken,
    ) -> Result<()> {
        self.inner.tokens.verify_and_consume(token)?;
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(NetError::ChannelClosed("coordinator is shut down".into()));
        }
        let transient_id = pending.transient_id;
        let outbound = pending.remote_endpoint.clone();
        let floor = if outbound.is_some() {
            self.inner.config.discard_pending_init_local
        } else {
            self.inner.config.discard_pending_init_remote
        };
        self.inner.store.add_init(pending);
        self.inner
            .arm_discard_timer(floor, "pending init", move |inner| {
                inner.store.discard_init(transient_id)
            });
        if let Some((addr, port)) = outbound {
            self.inner.dial(ManagerRole::Init, &addr, port)?;
        }
        Ok(())
    }

    /// Sends an instruction to a device, opening the command channel first
    /// when necessary. The returned future completes exactly once.
    pub async fn send_instruction(
        &self,
        device_id: DeviceId,
        instruction: Instruction,
        token: AuthorizationToken,
    ) -> Result<oneshot::Receiver<Result<InstructionResult>>> {
        self.inner.tokens.verify_and_consume(token)?;
        Ok(self.inner.submit_instruction(device_id, instruction).await)
    }

    /// Negotiates a new data channel with the device: delivers the CEK over
    /// the command channel, then dials the peer's data endpoint.
    pub async fn open_data_channel(
        &self,
        device_id: DeviceId,
        encrypt: bool,
        compress: bool,
        token: AuthorizationToken,
    ) -> Result<TransientConnectionId> {
        self.inner.tokens.verify_and_consume(token)?;
        let descriptor = self.inner.directory.device(device_id).await?;
        let transient_id: TransientConnectionId = rand::random();
        let cek = self
            .inner
            .crypto
            .new_symmetric_data(self.inner.config.default_cipher, self.inner.config.default_mode);

        let body = OpenDataConnectionBody {
            transient_id,
            cek_key: cek.key.clone(),
            cek_iv: cek.iv.clone(),
            cipher: self.inner.config.default_cipher,
            mode: self.inner.config.default_mode,
            encrypt,
            compress,
        };
        let receiver = self
            .inner
            .submit_instruction(
                device_id,
                Instruction::OpenDataConnection { device_id, body },
            )
            .await;
        let result = receiver
            .await
            .map_err(|_| NetError::ChannelClosed("instruction dropped".into()))??;
        let InstructionResult::OpenDataConnection { accepted } = result;
        if !accepted {
            return Err(NetError::Protocol(
                "peer rejected the data connection request".into(),
            ));
        }

        self.inner.store.add_data(PendingDataChannel {
            transient_id,
            device: descriptor.clone(),
            cek_key: cek.key,
            cek_iv: cek.iv,
            cipher: self.inner.config.default_cipher,
            mode: self.inner.config.default_mode,
            encrypt,
            compress,
        });
        self.inner.arm_discard_timer(
            self.inner.config.discard_pending_data,
            "pending data",
            move |inner| inner.store.discard_data(device_id, transient_id),
        );
        self.inner
            .dial(ManagerRole::Data, &descriptor.data_addr, descriptor.data_port)?;
        Ok(transient_id)
    }

    /// Sends an application payload over an established data channel.
    pub fn send_data(
        &self,
        device_id: DeviceId,
        transient_id: TransientConnectionId,
        payload: &[u8],
    ) -> Result<()> {
        let channel = self
            .inner
            .data_channels
            .lock()
            .get(&(device_id, transient_id))
            .cloned()
            .ok_or_else(|| {
                NetError::LookupMiss(format!(
                    "no data channel for device [{device_id}] transient [{transient_id}]"
                ))
            })?;
        channel.send_payload(payload)
    }

    pub fn has_command_channel(&self, device_id: DeviceId) -> bool {
        self.inner.command_channels.lock().contains_key(&device_id)
    }

    pub fn command_channel_count(&self) -> usize {
        self.inner.command_channels.lock().len()
    }

    pub fn has_data_channel(
        &self,
        device_id: DeviceId,
        transient_id: TransientConnectionId,
    ) -> bool {
        self.inner
            .data_channels
            .lock()
            .contains_key(&(device_id, transient_id))
    }

    pub fn pending_instruction_count(&self, device_id: DeviceId) -> usize {
        self.inner
            .pending_instructions
            .lock()
            .get(&device_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Pending-connection tables (pre-registration of inbound pairings,
    /// inspection in tests).
    pub fn store(&self) -> &ConnectionDataStore {
        &self.inner.store
    }

    /// Orderly teardown: flag, disconnect, drain, clear.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);
        for manager in self.inner.managers.lock().values() {
            manager.shutdown();
        }

        let command: Vec<_> = self.inner.command_channels.lock().drain().collect();
        let data: Vec<_> = self.inner.data_channels.lock().drain().collect();
        let active = command.len() + data.len();
        info!(target: "syncnet::coordinator", active, "closing active connections");
        for channel in command
            .into_iter()
            .map(|(_, channel)| channel)
            .chain(data.into_iter().map(|(_, channel)| channel))
        {
            if channel.mark_closed() {
                channel.teardown();
                self.inner.emit(CoordinatorEvent::ChannelClosed {
                    device_id: channel.device_id(),
                    connection_id: channel.connection_id(),
                    kind: channel.kind(),
                    transient_id: channel.transient_id(),
                });
            }
        }

        let queues: Vec<(DeviceId, Vec<QueuedInstruction>)> =
            self.inner.pending_instructions.lock().drain().collect();
        for (device_id, queue) in queues {
            warn!(
                target: "syncnet::coordinator",
                device = %device_id,
                count = queue.len(),
                "discarding pending instructions at shutdown"
            );
            for queued in queue {
                let _ = queued
                    .responder
                    .send(Err(NetError::ChannelClosed("coordinator shut down".into())));
            }
        }
        self.inner.store.clear();
    }
}

impl Inner {
    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events_tx.send(event);
    }

    fn dial(&self, role: ManagerRole, addr: &str, port: u16) -> Result<()> {
        let managers = self.managers.lock();
        let manager = managers.get(&role).ok_or_else(|| {
            NetError::Config(format!("no {role:?} connection manager attached"))
        })?;
        manager.dial(addr, port);
        Ok(())
    }

    fn arm_discard_timer<F>(self: &Arc<Self>, floor: std::time::Duration, what: &'static str, discard: F)
    where
        F: FnOnce(&Inner) -> bool + Send + 'static,
    {
        let inner = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = time::sleep(floor) => {
                    if discard(&inner) {
                        warn!(target: "syncnet::coordinator", what, "stale entry removed by discard timer");
                    }
                }
            }
        });
    }

    async fn submit_instruction(
        self: &Arc<Self>,
        device_id: DeviceId,
        instruction: Instruction,
    ) -> oneshot::Receiver<Result<InstructionResult>> {
        let (responder, receiver) = oneshot::channel();
        if self.shutdown.load(Ordering::SeqCst) {
            let _ = responder.send(Err(NetError::ChannelClosed("coordinator is shut down".into())));
            return receiver;
        }

        let channel = self.command_channels.lock().get(&device_id).cloned();
        if let Some(channel) = channel {
            self.dispatch_instruction(&channel, instruction, responder);
            return receiver;
        }

        let first_in_queue = {
            let mut queues = self.pending_instructions.lock();
            let queue = queues.entry(device_id).or_default();
            queue.push(QueuedInstruction {
                instruction,
                responder,
            });
            queue.len() == 1
        };

        // The channel may have been promoted between the registry check and
        // the queue push; flush immediately so the future still completes.
        let channel = self.command_channels.lock().get(&device_id).cloned();
        if let Some(channel) = channel {
            let queue = self.pending_instructions.lock().remove(&device_id);
            if let Some(queue) = queue {
                for queued in queue {
                    self.dispatch_instruction(&channel, queued.instruction, queued.responder);
                }
            }
            return receiver;
        }

        if first_in_queue {
            self.arm_queue_discard(device_id);
            match self.directory.device(device_id).await {
                Ok(descriptor) => {
                    self.store.add_command(descriptor.clone());
                    self.arm_discard_timer(
                        self.config.discard_pending_command,
                        "pending command",
                        move |inner| inner.store.discard_command(device_id),
                    );
                    if let Err(e) =
                        self.dial(ManagerRole::Command, &descriptor.command_addr, descriptor.command_port)
                    {
                        self.fail_pending_instructions(device_id, &e.to_string());
                    }
                }
                Err(e) => {
                    self.fail_pending_instructions(device_id, &e.to_string());
                }
            }
        }
        receiver
    }

    fn arm_queue_discard(self: &Arc<Self>, device_id: DeviceId) {
        let inner = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let floor = self.config.discard_pending_command;
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = time::sleep(floor) => {
                    if !inner.command_channels.lock().contains_key(&device_id) {
                        inner.fail_pending_instructions(
                            device_id,
                            "command channel was not established in time",
                        );
                    }
                }
            }
        });
    }

    fn fail_pending_instructions(&self, device_id: DeviceId, reason: &str) {
        let queue = self.pending_instructions.lock().remove(&device_id);
        if let Some(queue) = queue {
            warn!(
                target: "syncnet::coordinator",
                device = %device_id,
                count = queue.len(),
                reason,
                "discarding pending instructions"
            );
            for queued in queue {
                let _ = queued
                    .responder
                    .send(Err(NetError::ChannelClosed(reason.to_string())));
            }
        }
    }

    fn dispatch_instruction(
        &self,
        channel: &Arc<EstablishedChannel>,
        instruction: Instruction,
        responder: oneshot::Sender<Result<InstructionResult>>,
    ) {
        let command_id = channel.next_command_id();
        let serialized = match self.codec.serialize_command(&instruction, command_id) {
            Ok(serialized) => serialized,
            Err(e) => {
                let _ = responder.send(Err(e));
                return;
            }
        };
        if serialized.send_response {
            channel.register_pending(
                command_id,
                PendingCommand {
                    instruction,
                    responder,
                },
            );
        } else {
            debug!(
                target: "syncnet::coordinator",
                command_id,
                "instruction expects no response; future resolves at teardown"
            );
            drop(responder);
        }
        if let Err(e) = channel.send_payload(&serialized.bytes) {
            if let Some(pending) = channel.take_pending(command_id) {
                let _ = pending.responder.send(Err(e));
            }
        }
    }

    /// Registers a promoted channel; a second channel for the same key is a
    /// logic error and the duplicate is torn down.
    fn register_channel(self: &Arc<Self>, channel: Arc<EstablishedChannel>) -> bool {
        let inserted = match channel.kind() {
            ChannelKind::Command => {
                let mut channels = self.command_channels.lock();
                if channels.contains_key(&channel.device_id()) {
                    false
                } else {
                    channels.insert(channel.device_id(), Arc::clone(&channel));
                    true
                }
            }
            ChannelKind::Data => {
                let transient_id = channel.transient_id().unwrap_or_default();
                let key = (channel.device_id(), transient_id);
                let mut channels = self.data_channels.lock();
                if channels.contains_key(&key) {
                    false
                } else {
                    channels.insert(key, Arc::clone(&channel));
                    true
                }
            }
        };
        if !inserted {
            error!(
                target: "syncnet::coordinator",
                device = %channel.device_id(),
                kind = ?channel.kind(),
                "duplicate established channel; tearing down the new connection"
            );
            channel.mark_closed();
            channel.teardown();
            self.emit(CoordinatorEvent::HandshakeFailed {
                connection_id: channel.connection_id(),
                transient_id: channel.transient_id(),
            });
        }
        inserted
    }

    fn promote(self: &Arc<Self>, kind: ChannelKind, success: crate::handshake::HandshakeSuccess) {
        let connection_id = success.connection.raw_id();
        let channel = Arc::new(EstablishedChannel::new(
            success.device_id,
            connection_id,
            success.transient_id,
            kind,
            success.connection,
            success.handler,
            success.encrypt,
            success.compress,
            self.config.max_data_size,
        ));
        if !self.register_channel(Arc::clone(&channel)) {
            return;
        }
        channel.connection().enable_events();
        self.emit(CoordinatorEvent::ChannelEstablished {
            device_id: channel.device_id(),
            connection_id,
            kind,
            transient_id: channel.transient_id(),
        });

        if kind == ChannelKind::Command {
            let queue = self
                .pending_instructions
                .lock()
                .remove(&channel.device_id());
            if let Some(queue) = queue {
                debug!(
                    target: "syncnet::coordinator",
                    device = %channel.device_id(),
                    count = queue.len(),
                    "flushing pending instructions"
                );
                for queued in queue {
                    self.dispatch_instruction(&channel, queued.instruction, queued.responder);
                }
            }
        }

        tokio::spawn(channel_loop(
            Arc::clone(self),
            Arc::clone(&channel),
            success.events,
        ));
        tokio::spawn(inactivity_timer(Arc::clone(self), channel));
    }

    fn close_channel(self: &Arc<Self>, channel: &Arc<EstablishedChannel>) {
        if !channel.mark_closed() {
            return;
        }
        channel.teardown();
        match channel.kind() {
            ChannelKind::Command => {
                let mut channels = self.command_channels.lock();
                if channels
                    .get(&channel.device_id())
                    .is_some_and(|current| current.connection_id() == channel.connection_id())
                {
                    channels.remove(&channel.device_id());
                }
            }
            ChannelKind::Data => {
                let key = (
                    channel.device_id(),
                    channel.transient_id().unwrap_or_default(),
                );
                let mut channels = self.data_channels.lock();
                if channels
                    .get(&key)
                    .is_some_and(|current| current.connection_id() == channel.connection_id())
                {
                    channels.remove(&key);
                }
            }
        }
        info!(
            target: "syncnet::coordinator",
            device = %channel.device_id(),
            connection = channel.connection_id(),
            kind = ?channel.kind(),
            "established channel closed"
        );
        self.emit(CoordinatorEvent::ChannelClosed {
            device_id: channel.device_id(),
            connection_id: channel.connection_id(),
            kind: channel.kind(),
            transient_id: channel.transient_id(),
        });
    }

    async fn handle_channel_frame(
        self: &Arc<Self>,
        channel: &Arc<EstablishedChannel>,
        frame: &[u8],
    ) -> Result<()> {
        match channel.kind() {
            ChannelKind::Data => {
                let payload = channel.open(frame)?;
                self.emit(CoordinatorEvent::DataReceived {
                    device_id: channel.device_id(),
                    transient_id: channel.transient_id().unwrap_or_default(),
                    bytes: payload,
                });
                Ok(())
            }
            ChannelKind::Command => {
                let plaintext = channel.open(frame)?;
                match self.codec.parse_command(&plaintext, channel.device_id()) {
                    Ok(parsed) => self.execute_inbound(channel, parsed).await,
                    Err(NetError::Decode(_)) => {
                        let (command_id, result) = self.codec.parse_response(&plaintext)?;
                        match channel.take_pending(command_id) {
                            Some(pending) => {
                                let _ = pending.responder.send(Ok(result));
                                Ok(())
                            }
                            None => Err(NetError::LookupMiss(format!(
                                "no pending instruction for command [{command_id}]"
                            ))),
                        }
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Executes an inbound instruction and, when requested, returns the
    /// serialized response over the same channel.
    async fn execute_inbound(
        self: &Arc<Self>,
        channel: &Arc<EstablishedChannel>,
        parsed: ParsedCommand,
    ) -> Result<()> {
        let result = match &parsed.instruction {
            Instruction::OpenDataConnection { device_id, body } => {
                let accepted = match self.directory.device(*device_id).await {
                    Ok(descriptor) => {
                        let transient_id = body.transient_id;
                        let device_id = *device_id;
                        self.store.add_data(PendingDataChannel {
                            transient_id,
                            device: descriptor,
                            cek_key: body.cek_key.clone(),
                            cek_iv: body.cek_iv.clone(),
                            cipher: body.cipher,
                            mode: body.mode,
                            encrypt: body.encrypt,
                            compress: body.compress,
                        });
                        self.arm_discard_timer(
                            self.config.discard_pending_data,
                            "pending data",
                            move |inner| inner.store.discard_data(device_id, transient_id),
                        );
                        true
                    }
                    Err(e) => {
                        warn!(
                            target: "syncnet::coordinator",
                            device = %device_id,
                            error = %e,
                            "rejecting data connection request"
                        );
                        false
                    }
                };
                InstructionResult::OpenDataConnection { accepted }
            }
        };
        if let Some(respond) = parsed.respond {
            let bytes = respond(&result)?;
            channel.send_payload(&bytes)?;
        }
        Ok(())
    }
}

async fn manager_pump(
    inner: Arc<Inner>,
    role: ManagerRole,
    mut events: mpsc::UnboundedReceiver<ManagerEvent>,
) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ManagerEvent::ConnectionCreated { connection, events, origin } => {
                        if inner.shutdown.load(Ordering::SeqCst) {
                            connection.disconnect();
                            continue;
                        }
                        tokio::spawn(run_handshake(
                            Arc::clone(&inner),
                            role,
                            origin,
                            connection,
                            events,
                        ));
                    }
                    ManagerEvent::InitiationFailed { peer, error } => {
                        warn!(
                            target: "syncnet::coordinator",
                            %peer,
                            %error,
                            ?role,
                            "connection initiation failed"
                        );
                        inner.clean_up_failed_dial(role, &peer);
                        inner.emit(CoordinatorEvent::InitiationFailed { peer });
                    }
                }
            }
        }
    }
}

impl Inner {
    /// Removes the pending entries that were waiting on a dial that never
    /// produced a connection.
    fn clean_up_failed_dial(self: &Arc<Self>, role: ManagerRole, peer: &str) {
        let Some((addr, port)) = peer
            .rsplit_once(':')
            .and_then(|(addr, port)| port.parse::<u16>().ok().map(|port| (addr, port)))
        else {
            return;
        };
        match role {
            ManagerRole::Init => {
                if let Ok(pending) = self.store.init_by_endpoint(addr, port) {
                    self.store.discard_init(pending.transient_id);
                    self.emit(CoordinatorEvent::PairingFailed);
                }
            }
            ManagerRole::Command => {
                if let Ok(descriptor) = self.store.command_by_endpoint(addr, port) {
                    self.store.discard_command(descriptor.device_id);
                    self.fail_pending_instructions(
                        descriptor.device_id,
                        "connection initiation failed",
                    );
                }
            }
            ManagerRole::Data => {
                let _ = self.store.take_data_by_endpoint(addr, port);
            }
        }
    }
}

async fn run_handshake(
    inner: Arc<Inner>,
    role: ManagerRole,
    origin: ConnectionOrigin,
    connection: crate::connection::Connection,
    events: EventReceiver,
) {
    let connection_id = connection.raw_id();
    let peer = connection.peer_addr();
    let io = HandshakeIo::new(connection, events);

    match role {
        ManagerRole::Init => {
            let timeout = inner.config.setup_timeout_init;
            let run = async {
                let handshake = InitHandshake::new(io, &*inner);
                match origin {
                    ConnectionOrigin::Local => {
                        let pending = inner
                            .store
                            .init_by_endpoint(&peer.ip().to_string(), peer.port())
                            .map_err(|error| {
                                crate::handshake::HandshakeFailure {
                                    error,
                                    state: crate::handshake::HandshakeState::Failed,
                                }
                            })?;
                        handshake.run_local(pending).await
                    }
                    ConnectionOrigin::Remote => handshake.run_remote().await,
                }
            };
            match time::timeout(timeout, run).await {
                Ok(Ok(outcome)) => {
                    inner.emit(CoordinatorEvent::PairingCompleted {
                        device_id: outcome.device_id,
                    });
                }
                Ok(Err(failure)) => {
                    debug!(
                        target: "syncnet::coordinator",
                        connection = connection_id,
                        error = %failure.error,
                        "pairing failed"
                    );
                    inner.emit(CoordinatorEvent::PairingFailed);
                }
                Err(_) => {
                    warn!(
                        target: "syncnet::coordinator",
                        connection = connection_id,
                        "pairing timed out"
                    );
                    if origin == ConnectionOrigin::Local {
                        if let Ok(pending) =
                            inner.store.init_by_endpoint(&peer.ip().to_string(), peer.port())
                        {
                            inner.store.discard_init(pending.transient_id);
                        }
                    }
                    inner.emit(CoordinatorEvent::PairingFailed);
                }
            }
        }
        ManagerRole::Command => {
            let timeout = inner.config.setup_timeout_command;
            let mut dialed_device = None;
            let run = async {
                let handshake = CommandHandshake::new(io, &*inner);
                match origin {
                    ConnectionOrigin::Local => {
                        let descriptor = inner
                            .store
                            .command_by_endpoint(&peer.ip().to_string(), peer.port())
                            .map_err(|error| crate::handshake::HandshakeFailure {
                                error,
                                state: crate::handshake::HandshakeState::Failed,
                            })?;
                        handshake.run_local(descriptor).await
                    }
                    ConnectionOrigin::Remote => handshake.run_remote().await,
                }
            };
            if origin == ConnectionOrigin::Local {
                dialed_device = inner
                    .store
                    .command_by_endpoint(&peer.ip().to_string(), peer.port())
                    .ok()
                    .map(|descriptor| descriptor.device_id);
            }
            match time::timeout(timeout, run).await {
                Ok(Ok(success)) => inner.promote(ChannelKind::Command, success),
                Ok(Err(failure)) => {
                    inner.emit(CoordinatorEvent::HandshakeFailed {
                        connection_id,
                        transient_id: None,
                    });
                    if let Some(device_id) = dialed_device {
                        inner.fail_pending_instructions(device_id, &failure.error.to_string());
                    }
                }
                Err(_) => {
                    warn!(
                        target: "syncnet::coordinator",
                        connection = connection_id,
                        "command handshake timed out"
                    );
                    if let Some(device_id) = dialed_device {
                        inner.store.discard_command(device_id);
                        inner.fail_pending_instructions(device_id, "command handshake timed out");
                    }
                    inner.emit(CoordinatorEvent::HandshakeFailed {
                        connection_id,
                        transient_id: None,
                    });
                }
            }
        }
        ManagerRole::Data => {
            let timeout = inner.config.setup_timeout_data;
            let run = async {
                let handshake = DataHandshake::new(io, &*inner);
                match origin {
                    ConnectionOrigin::Local => {
                        let pending = inner
                            .store
                            .take_data_by_endpoint(&peer.ip().to_string(), peer.port())
                            .map_err(|error| crate::handshake::HandshakeFailure {
                                error,
                                state: crate::handshake::HandshakeState::Failed,
                            })?;
                        handshake.run_local(pending).await
                    }
                    ConnectionOrigin::Remote => handshake.run_remote().await,
                }
            };
            match time::timeout(timeout, run).await {
                Ok(Ok(success)) => inner.promote(ChannelKind::Data, success),
                Ok(Err(failure)) => {
                    debug!(
                        target: "syncnet::coordinator",
                        connection = connection_id,
                        error = %failure.error,
                        "data handshake failed"
                    );
                    inner.emit(CoordinatorEvent::HandshakeFailed {
                        connection_id,
                        transient_id: None,
                    });
                }
                Err(_) => {
                    warn!(
                        target: "syncnet::coordinator",
                        connection = connection_id,
                        "data handshake timed out"
                    );
                    inner.emit(CoordinatorEvent::HandshakeFailed {
                        connection_id,
                        transient_id: None,
                    });
                }
            }
        }
    }
}

async fn channel_loop(
    inner: Arc<Inner>,
    channel: Arc<EstablishedChannel>,
    mut events: EventReceiver,
) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let mut assembly: Vec<u8> = Vec::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                channel.bump_event_counter();
                match event {
                    ConnectionEvent::DataReceived { bytes, remaining_in_frame } => {
                        assembly.extend_from_slice(&bytes);
                        if remaining_in_frame == 0 {
                            let frame = std::mem::take(&mut assembly);
                            match inner.handle_channel_frame(&channel, &frame).await {
                                Ok(()) => {}
                                Err(e) if e.closes_channel() => {
                                    warn!(
                                        target: "syncnet::coordinator",
                                        device = %channel.device_id(),
                                        error = %e,
                                        "closing channel"
                                    );
                                    break;
                                }
                                Err(e) => {
                                    // A malformed frame must not let a peer
                                    // take the channel down.
                                    debug!(
                                        target: "syncnet::coordinator",
                                        device = %channel.device_id(),
                                        error = %e,
                                        "ignoring malformed inbound message"
                                    );
                                }
                            }
                        }
                    }
                    ConnectionEvent::WriteAcknowledged { success: true } => {
                        channel.acknowledge_write();
                    }
                    ConnectionEvent::WriteAcknowledged { success: false } => {
                        channel.acknowledge_write();
                        warn!(
                            target: "syncnet::coordinator",
                            device = %channel.device_id(),
                            "outbound write failed; closing channel"
                        );
                        break;
                    }
                    ConnectionEvent::Disconnected { .. } => break,
                }
            }
        }
    }
    inner.close_channel(&channel);
}

async fn inactivity_timer(inner: Arc<Inner>, channel: Arc<EstablishedChannel>) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let mut ticker = time::interval(inner.config.inactivity_interval);
    ticker.tick().await;
    let mut last = channel.event_count();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = ticker.tick() => {
                if channel.is_closed() {
                    return;
                }
                let current = channel.event_count();
                if current == last {
                    info!(
                        target: "syncnet::coordinator",
                        device = %channel.device_id(),
                        connection = channel.connection_id(),
                        "closing inactive channel"
                    );
                    inner.close_channel(&channel);
                    return;
                }
                last = current;
            }
        }
    }
}
