//! Device records and the narrow storage interfaces the core consumes.
//!
//! The relational storage layer lives outside this crate; the core only
//! needs read-through descriptor lookups, descriptor updates after pairing,
//! and the per-peer authentication secrets. In-memory implementations are
//! provided for tests and single-process embedders.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{NetError, Result};
use crate::messages::{DeviceId, KeyExchangeKind, PeerRole, UserId};

/// Persistent record describing a known remote peer.
///
/// Created during pairing, updated when endpoints or keys change, read on
/// every new channel.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub device_id: DeviceId,
    pub owner: UserId,
    pub role: PeerRole,
    pub command_addr: String,
    pub command_port: u16,
    pub data_addr: String,
    pub data_port: u16,
    pub init_addr: String,
    pub init_port: u16,
    pub public_key: Vec<u8>,
    pub key_exchange: KeyExchangeKind,
}

/// Secret the local side presents to one remote peer.
#[derive(Debug, Clone)]
pub struct LocalAuthenticationEntry {
    pub remote_device_id: DeviceId,
    pub plaintext_password: String,
}

/// Read-through access to device descriptors.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn device(&self, id: DeviceId) -> Result<DeviceDescriptor>;
    async fn update(&self, descriptor: DeviceDescriptor) -> Result<()>;
}

/// Access to the per-peer authentication secrets.
#[async_trait]
pub trait AuthenticationStore: Send + Sync {
    async fn entry(&self, remote: DeviceId) -> Result<LocalAuthenticationEntry>;
    async fn put(&self, entry: LocalAuthenticationEntry) -> Result<()>;
}

/// Process-local descriptor table.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    devices: Mutex<HashMap<DeviceId, DeviceDescriptor>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, descriptor: DeviceDescriptor) {
        self.devices.lock().insert(descriptor.device_id, descriptor);
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDirectory {
    async fn device(&self, id: DeviceId) -> Result<DeviceDescriptor> {
        self.devices
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| NetError::LookupMiss(format!("no descriptor for device [{id}]")))
    }

    async fn update(&self, descriptor: DeviceDescriptor) -> Result<()> {
        self.devices.lock().insert(descriptor.device_id, descriptor);
        Ok(())
    }
}

/// Process-local authentication table.
#[derive(Debug, Default)]
pub struct MemoryAuthenticationStore {
    entries: Mutex<HashMap<DeviceId, LocalAuthenticationEntry>>,
}

impl MemoryAuthenticationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthenticationStore for MemoryAuthenticationStore {
    async fn entry(&self, remote: DeviceId) -> Result<LocalAuthenticationEntry> {
        self.entries
            .lock()
            .get(&remote)
            .cloned()
            .ok_or_else(|| NetError::LookupMiss(format!("no authentication entry for [{remote}]")))
    }

    async fn put(&self, entry: LocalAuthenticationEntry) -> Result<()> {
        self.entries.lock().insert(entry.remote_device_id, entry);
        Ok(())
    }
}
