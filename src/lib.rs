//! Secure connection core of a peer-to-peer file-synchronization server.
//!
//! Implements the connection lifecycle and the three handshake families
//! (pairing, command channel, data channel) over length-prefixed CBOR
//! frames on TCP, protected with AEAD ciphers and RSA or X25519 key
//! transport. The coordinator glues handshakes to connection managers,
//! promotes completed handshakes into established channels, and routes
//! command responses to per-request futures.

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod crypto;
pub mod device;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod messages;
pub mod password;
pub mod store;
pub mod testkit;
pub mod tokens;

pub use channel::{ChannelKind, EstablishedChannel};
pub use codec::{CommandCodec, Instruction, InstructionResult};
pub use config::NetworkConfig;
pub use connection::{Connection, ConnectionEvent};
pub use coordinator::{CoordinatorEvent, NetworkCoordinator};
pub use crypto::{CryptoService, LocalIdentity, SymmetricHandler};
pub use device::{
    AuthenticationStore, DeviceDescriptor, DeviceDirectory, LocalAuthenticationEntry,
    MemoryAuthenticationStore, MemoryDirectory,
};
pub use error::{NetError, Result};
pub use manager::{ConnectionManager, ConnectionOrigin, ManagerEvent, ManagerRole};
pub use messages::{
    CipherKind, CipherMode, CommandId, ConnectionId, DeviceId, KeyExchangeKind, PeerRole,
    TransientConnectionId, UserId,
};
pub use store::{ConnectionDataStore, PendingDataChannel, PendingInitSetup};
pub use tokens::{AuthorizationToken, AuthorizationTokenStore};
