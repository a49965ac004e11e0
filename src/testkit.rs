//! Helpers for wiring coordinator pairs in tests and examples.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::NetworkConfig;
use crate::coordinator::{CoordinatorEvent, NetworkCoordinator};
use crate::crypto::{CryptoService, LocalIdentity};
use crate::device::{
    AuthenticationStore, DeviceDescriptor, LocalAuthenticationEntry, MemoryAuthenticationStore,
    MemoryDirectory,
};
use crate::error::Result;
use crate::manager::ManagerRole;
use crate::messages::{DeviceId, KeyExchangeKind, PeerRole, UserId};

/// A fully wired node listening on ephemeral localhost ports.
pub struct TestNode {
    pub coordinator: NetworkCoordinator,
    pub events: mpsc::UnboundedReceiver<CoordinatorEvent>,
    pub device_id: DeviceId,
    pub role: PeerRole,
    pub key_exchange: KeyExchangeKind,
    pub public_key: Vec<u8>,
    pub directory: Arc<MemoryDirectory>,
    pub auth: Arc<MemoryAuthenticationStore>,
    pub command_addr: SocketAddr,
    pub data_addr: SocketAddr,
    pub init_addr: SocketAddr,
}

impl TestNode {
    /// Starts a node with all three managers bound to 127.0.0.1:0.
    pub async fn start(
        config: NetworkConfig,
        role: PeerRole,
        key_exchange: KeyExchangeKind,
    ) -> Result<Self> {
        let device_id = Uuid::new_v4();
        let identity = LocalIdentity::generate(device_id, role, key_exchange)?;
        let public_key = identity.public_key_bytes()?;
        let directory = Arc::new(MemoryDirectory::new());
        let auth = Arc::new(MemoryAuthenticationStore::new());
        let (coordinator, events) = NetworkCoordinator::new(
            config,
            CryptoService::new(),
            identity,
            Arc::clone(&directory) as Arc<dyn crate::device::DeviceDirectory>,
            Arc::clone(&auth) as Arc<dyn crate::device::AuthenticationStore>,
        )?;
        let init_addr = coordinator.attach_manager(ManagerRole::Init, "127.0.0.1", 0).await?;
        let command_addr = coordinator
            .attach_manager(ManagerRole::Command, "127.0.0.1", 0)
            .await?;
        let data_addr = coordinator.attach_manager(ManagerRole::Data, "127.0.0.1", 0).await?;
        Ok(Self {
            coordinator,
            events,
            device_id,
            role,
            key_exchange,
            public_key,
            directory,
            auth,
            command_addr,
            data_addr,
            init_addr,
        })
    }

    /// Descriptor under which peers should record this node.
    pub fn descriptor(&self, owner: UserId) -> DeviceDescriptor {
        DeviceDescriptor {
            device_id: self.device_id,
            owner,
            role: self.role,
            command_addr: self.command_addr.ip().to_string(),
            command_port: self.command_addr.port(),
            data_addr: self.data_addr.ip().to_string(),
            data_port: self.data_addr.port(),
            init_addr: self.init_addr.ip().to_string(),
            init_port: self.init_addr.port(),
            public_key: self.public_key.clone(),
            key_exchange: self.key_exchange,
        }
    }

    /// Records the peer's descriptor and the shared authentication password,
    /// as a completed pairing would have.
    pub async fn trust(&self, peer: &TestNode, password: &str) -> Result<()> {
        self.directory.insert(peer.descriptor(Uuid::new_v4()));
        self.auth
            .put(LocalAuthenticationEntry {
                remote_device_id: peer.device_id,
                plaintext_password: password.to_string(),
            })
            .await
    }
}

/// Waits for the next event matching `predicate`, skipping others.
pub async fn next_matching<F>(
    events: &mut mpsc::UnboundedReceiver<CoordinatorEvent>,
    mut predicate: F,
) -> CoordinatorEvent
where
    F: FnMut(&CoordinatorEvent) -> bool,
{
    loop {
        let event = events.recv().await.expect("coordinator event stream open");
        if predicate(&event) {
            return event;
        }
    }
}
