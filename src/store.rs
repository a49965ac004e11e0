//! Indexed tables of pending-connection descriptors.
//!
//! Three tables, one lock each, held only for the index operation itself.
//! Entries are exclusively owned by the store; handshakes read snapshots and
//! either complete (consuming or discarding the entry), fail (discarding it),
//! or leave it for the discard timer.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::device::DeviceDescriptor;
use crate::error::{NetError, Result};
use crate::messages::{CipherKind, CipherMode, DeviceId, PeerRole, TransientConnectionId, UserId};

/// Network endpoint as carried in descriptors.
pub type Endpoint = (String, u16);

/// Descriptor of an expected or initiated pairing.
#[derive(Debug, Clone)]
pub struct PendingInitSetup {
    pub transient_id: TransientConnectionId,
    pub shared_password: String,
    pub remote_role: PeerRole,
    /// User on whose behalf the pairing was requested.
    pub owner: UserId,
    /// Device id assigned locally to the not-yet-known peer.
    pub new_device_id: DeviceId,
    /// Target endpoint when this side will dial; `None` when waiting inbound.
    pub remote_endpoint: Option<Endpoint>,
}

/// Descriptor of a soon-to-be-opened data channel.
#[derive(Debug, Clone)]
pub struct PendingDataChannel {
    pub transient_id: TransientConnectionId,
    pub device: DeviceDescriptor,
    pub cek_key: Vec<u8>,
    pub cek_iv: Vec<u8>,
    pub cipher: CipherKind,
    pub mode: CipherMode,
    pub encrypt: bool,
    pub compress: bool,
}

#[derive(Debug, Default)]
struct InitTable {
    by_transient: BTreeMap<TransientConnectionId, PendingInitSetup>,
    by_endpoint: HashMap<Endpoint, TransientConnectionId>,
}

#[derive(Debug, Default)]
struct CommandTable {
    by_device: BTreeMap<DeviceId, DeviceDescriptor>,
    by_endpoint: HashMap<Endpoint, DeviceId>,
}

#[derive(Debug, Default)]
struct DataTable {
    by_key: BTreeMap<(DeviceId, TransientConnectionId), PendingDataChannel>,
    by_endpoint: HashMap<Endpoint, Vec<(DeviceId, TransientConnectionId)>>,
}

/// Thread-safe set of the three pending tables.
#[derive(Debug, Default)]
pub struct ConnectionDataStore {
    init: Mutex<InitTable>,
    command: Mutex<CommandTable>,
    data: Mutex<DataTable>,
}

impl ConnectionDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_init(&self, entry: PendingInitSetup) {
        let mut table = self.init.lock();
        if let Some(endpoint) = entry.remote_endpoint.clone() {
            table.by_endpoint.insert(endpoint, entry.transient_id);
        }
        table.by_transient.insert(entry.transient_id, entry);
    }

    pub fn init_by_transient(&self, transient_id: TransientConnectionId) -> Result<PendingInitSetup> {
        self.init
            .lock()
            .by_transient
            .get(&transient_id)
            .cloned()
            .ok_or_else(|| {
                NetError::LookupMiss(format!("no pending init for transient [{transient_id}]"))
            })
    }

    pub fn init_by_endpoint(&self, addr: &str, port: u16) -> Result<PendingInitSetup> {
        let table = self.init.lock();
        table
            .by_endpoint
            .get(&(addr.to_string(), port))
            .and_then(|id| table.by_transient.get(id))
            .cloned()
            .ok_or_else(|| NetError::LookupMiss(format!("no pending init for [{addr}:{port}]")))
    }

    /// Removes a pending-init entry; a second discard reports not-present.
    pub fn discard_init(&self, transient_id: TransientConnectionId) -> bool {
        let mut table = self.init.lock();
        match table.by_transient.remove(&transient_id) {
            Some(entry) => {
                if let Some(endpoint) = entry.remote_endpoint {
                    table.by_endpoint.remove(&endpoint);
                }
                true
            }
            None => false,
        }
    }

    pub fn has_init(&self, transient_id: TransientConnectionId) -> bool {
        self.init.lock().by_transient.contains_key(&transient_id)
    }

    pub fn add_command(&self, descriptor: DeviceDescriptor) {
        let mut table = self.command.lock();
        table.by_endpoint.insert(
            (descriptor.command_addr.clone(), descriptor.command_port),
            descriptor.device_id,
        );
        table.by_device.insert(descriptor.device_id, descriptor);
    }

    pub fn command_by_device(&self, device_id: DeviceId) -> Result<DeviceDescriptor> {
        self.command
            .lock()
            .by_device
            .get(&device_id)
            .cloned()
            .ok_or_else(|| {
                NetError::LookupMiss(format!("no pending command connection for [{device_id}]"))
            })
    }

    pub fn command_by_endpoint(&self, addr: &str, port: u16) -> Result<DeviceDescriptor> {
        let table = self.command.lock();
        table
            .by_endpoint
            .get(&(addr.to_string(), port))
            .and_then(|id| table.by_device.get(id))
            .cloned()
            .ok_or_else(|| {
                NetError::LookupMiss(format!("no pending command connection for [{addr}:{port}]"))
            })
    }

    pub fn discard_command(&self, device_id: DeviceId) -> bool {
        let mut table = self.command.lock();
        match table.by_device.remove(&device_id) {
            Some(descriptor) => {
                table
                    .by_endpoint
                    .remove(&(descriptor.command_addr, descriptor.command_port));
                true
            }
            None => false,
        }
    }

    pub fn has_command(&self, device_id: DeviceId) -> bool {
        self.command.lock().by_device.contains_key(&device_id)
    }

    pub fn add_data(&self, entry: PendingDataChannel) {
        let mut table = self.data.lock();
        let key = (entry.device.device_id, entry.transient_id);
        table
            .by_endpoint
            .entry((entry.device.data_addr.clone(), entry.device.data_port))
            .or_default()
            .push(key);
        table.by_key.insert(key, entry);
    }

    /// Looks up and consumes the matching pending-data entry.
    ///
    /// Consumption models the at-most-one-match rule: a second handshake for
    /// the same (device, transient) pair misses.
    pub fn take_data(
        &self,
        device_id: DeviceId,
        transient_id: TransientConnectionId,
    ) -> Result<PendingDataChannel> {
        let mut table = self.data.lock();
        let key = (device_id, transient_id);
        match table.by_key.remove(&key) {
            Some(entry) => {
                Self::unindex_data(&mut table, &entry, key);
                Ok(entry)
            }
            None => Err(NetError::LookupMiss(format!(
                "no pending data channel for device [{device_id}] transient [{transient_id}]"
            ))),
        }
    }

    /// Consumes the first pending-data entry targeted at the endpoint.
    pub fn take_data_by_endpoint(&self, addr: &str, port: u16) -> Result<PendingDataChannel> {
        let mut table = self.data.lock();
        let endpoint = (addr.to_string(), port);
        let key = table
            .by_endpoint
            .get(&endpoint)
            .and_then(|keys| keys.first().copied())
            .ok_or_else(|| {
                NetError::LookupMiss(format!("no pending data channel for [{addr}:{port}]"))
            })?;
        let entry = table
            .by_key
            .remove(&key)
            .ok_or_else(|| NetError::LookupMiss(format!("no pending data channel for [{addr}:{port}]")))?;
        Self::unindex_data(&mut table, &entry, key);
        Ok(entry)
    }

    pub fn discard_data(&self, device_id: DeviceId, transient_id: TransientConnectionId) -> bool {
        self.take_data(device_id, transient_id).is_ok()
    }

    pub fn has_data(&self, device_id: DeviceId, transient_id: TransientConnectionId) -> bool {
        self.data
            .lock()
            .by_key
            .contains_key(&(device_id, transient_id))
    }

    /// Drops every entry in all three tables.
    pub fn clear(&self) {
        let mut init = self.init.lock();
        init.by_transient.clear();
        init.by_endpoint.clear();
        drop(init);
        let mut command = self.command.lock();
        command.by_device.clear();
        command.by_endpoint.clear();
        drop(command);
        let mut data = self.data.lock();
        data.by_key.clear();
        data.by_endpoint.clear();
    }

    fn unindex_data(
        table: &mut DataTable,
        entry: &PendingDataChannel,
        key: (DeviceId, TransientConnectionId),
    ) {
        let endpoint = (entry.device.data_addr.clone(), entry.device.data_port);
        if let Some(keys) = table.by_endpoint.get_mut(&endpoint) {
            keys.retain(|k| *k != key);
            if keys.is_empty() {
                table.by_endpoint.remove(&endpoint);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::KeyExchangeKind;
    use uuid::Uuid;

    fn descriptor(device_id: DeviceId) -> DeviceDescriptor {
        DeviceDescriptor {
            device_id,
            owner: Uuid::new_v4(),
            role: PeerRole::Server,
            command_addr: "127.0.0.1".into(),
            command_port: 9001,
            data_addr: "127.0.0.1".into(),
            data_port: 9002,
            init_addr: "127.0.0.1".into(),
            init_port: 9003,
            public_key: vec![0; 32],
            key_exchange: KeyExchangeKind::Rsa,
        }
    }

    fn data_entry(device_id: DeviceId, transient_id: u64) -> PendingDataChannel {
        PendingDataChannel {
            transient_id,
            device: descriptor(device_id),
            cek_key: vec![1; 32],
            cek_iv: vec![2; 12],
            cipher: CipherKind::Aes,
            mode: CipherMode::Gcm,
            encrypt: true,
            compress: false,
        }
    }

    #[test]
    fn init_entries_reachable_by_both_indices() {
        let store = ConnectionDataStore::new();
        store.add_init(PendingInitSetup {
            transient_id: 0x1111_1111,
            shared_password: "correct horse battery staple".into(),
            remote_role: PeerRole::Server,
            owner: Uuid::new_v4(),
            new_device_id: Uuid::new_v4(),
            remote_endpoint: Some(("10.0.0.9".into(), 4000)),
        });
        assert!(store.has_init(0x1111_1111));
        assert_eq!(
            store.init_by_endpoint("10.0.0.9", 4000).unwrap().transient_id,
            0x1111_1111
        );
        assert!(store.discard_init(0x1111_1111));
        assert!(!store.discard_init(0x1111_1111));
        assert!(store.init_by_endpoint("10.0.0.9", 4000).is_err());
    }

    #[test]
    fn data_get_by_id_consumes() {
        let store = ConnectionDataStore::new();
        let device = Uuid::new_v4();
        store.add_data(data_entry(device, 42));
        assert!(store.has_data(device, 42));
        store.take_data(device, 42).unwrap();
        assert!(matches!(
            store.take_data(device, 42),
            Err(NetError::LookupMiss(_))
        ));
    }

    #[test]
    fn data_endpoint_index_matches_multiple() {
        let store = ConnectionDataStore::new();
        let device = Uuid::new_v4();
        store.add_data(data_entry(device, 1));
        store.add_data(data_entry(device, 2));
        let first = store.take_data_by_endpoint("127.0.0.1", 9002).unwrap();
        let second = store.take_data_by_endpoint("127.0.0.1", 9002).unwrap();
        assert_ne!(first.transient_id, second.transient_id);
        assert!(store.take_data_by_endpoint("127.0.0.1", 9002).is_err());
    }

    #[test]
    fn discard_twice_is_idempotent() {
        let store = ConnectionDataStore::new();
        let device = Uuid::new_v4();
        store.add_command(descriptor(device));
        assert!(store.discard_command(device));
        assert!(!store.discard_command(device));
        store.add_data(data_entry(device, 9));
        assert!(store.discard_data(device, 9));
        assert!(!store.discard_data(device, 9));
    }
}
