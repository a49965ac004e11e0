//! Wire vocabulary of the connection core.
//!
//! Every message is a CBOR-encoded record carried in a length-prefixed frame.
//! The vocabulary is fixed: three handshake exchanges plus one command and
//! one response envelope. Byte arrays carry explicit lengths.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NetError, Result};

pub type DeviceId = Uuid;
pub type UserId = Uuid;
/// Locally unique, monotonic for the process lifetime.
pub type ConnectionId = u64;
/// Scalar agreed by both peers for the duration of a single handshake.
pub type TransientConnectionId = u64;
/// Monotonic per command channel.
pub type CommandId = u64;

/// Symmetric block cipher negotiated per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherKind {
    Aes,
    Twofish,
    Serpent,
}

/// AEAD mode paired with [`CipherKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherMode {
    Gcm,
    Ccm,
    Eax,
}

/// Key-transport flavor used by the command-channel handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyExchangeKind {
    Rsa,
    Ecdh,
}

/// Role a peer plays with respect to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Client,
    Server,
}

/// Terminal status of a command response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    Failed,
}

/// Random liveness token echoed by the responder of each handshake.
///
/// Serialized as (size, bytes); a size that disagrees with the byte count is
/// rejected at decode time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSignature {
    pub size: u32,
    pub data: Vec<u8>,
}

impl RequestSignature {
    pub const DEFAULT_LENGTH: usize = 16;

    pub fn generate(length: usize) -> Self {
        let mut data = vec![0_u8; length];
        rand::thread_rng().fill_bytes(&mut data);
        Self {
            size: length as u32,
            data,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let signature: Self = decode(bytes)?;
        if signature.size as usize != signature.data.len() {
            return Err(NetError::Decode(format!(
                "request signature size mismatch: declared {}, found {}",
                signature.size,
                signature.data.len()
            )));
        }
        Ok(signature)
    }

    pub fn matches(&self, other: &Self) -> bool {
        self.size == other.size && self.data == other.data
    }
}

/// First message of the pairing handshake, sent by the initiator.
///
/// `additional_data` is a [`SetupAdditional`] encrypted under the key derived
/// from the shared pairing password with the parameters carried alongside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupRequest {
    pub pbkd_salt: Vec<u8>,
    pub pbkd_iv: Vec<u8>,
    pub pbkd_iterations: u32,
    pub pbkd_cipher: CipherKind,
    pub pbkd_mode: CipherMode,
    pub transient_id: TransientConnectionId,
    pub additional_data: Vec<u8>,
}

/// Identity payload exchanged (encrypted) in both pairing directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupAdditional {
    /// Serialized [`RequestSignature`]; echoed verbatim by the responder.
    pub request_signature: Vec<u8>,
    pub public_key: Vec<u8>,
    pub command_addr: String,
    pub command_port: u16,
    pub data_addr: String,
    pub data_port: u16,
    pub init_addr: String,
    pub init_port: u16,
    pub key_exchange: KeyExchangeKind,
    /// Device id the sender has assigned to the receiver.
    pub remote_peer_id: DeviceId,
    /// Sender's own device id; present iff the sender's role is not SERVER.
    pub local_peer_id: Option<DeviceId>,
    /// Authentication password; present iff the receiver's role is SERVER.
    pub password_data: Option<String>,
}

/// Second and final message of the pairing handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupResponse {
    pub additional_data: Vec<u8>,
}

/// First message of the command-channel handshake.
///
/// `data` is a [`CmdRequestInner`] protected according to the peer's
/// key-exchange kind: RSA-signed-then-encrypted, or AEAD-encrypted under an
/// ECDH-derived key whose IV travels in `ecdh_iv`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdRequest {
    pub peer_id: DeviceId,
    pub data: Vec<u8>,
    pub ecdh_iv: Option<Vec<u8>>,
}

/// Content-encryption-key material transported by [`CmdRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdRequestInner {
    pub cipher: CipherKind,
    pub mode: CipherMode,
    pub request_signature: Vec<u8>,
    pub cek_key: Vec<u8>,
    pub cek_iv: Vec<u8>,
    pub password_data: Option<String>,
}

/// Final message of the command-channel handshake; travels CEK-encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdResponse {
    pub request_signature: Vec<u8>,
    pub password_data: String,
}

/// First message of the data-channel handshake.
///
/// `request_signature` is a serialized [`RequestSignature`] encrypted under
/// the CEK agreed over the command channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRequest {
    pub peer_id: DeviceId,
    pub transient_id: TransientConnectionId,
    pub request_signature: Vec<u8>,
}

/// Final message of the data-channel handshake; signature is CEK-encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataResponse {
    pub request_signature: Vec<u8>,
}

/// Outbound command envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command: String,
    pub command_id: CommandId,
    pub data: Vec<u8>,
    pub send_response: bool,
}

/// Outbound response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub command: String,
    pub command_id: CommandId,
    pub status: ResponseStatus,
    pub data: Option<Vec<u8>>,
}

/// Body of the single registered command: instructs the peer to expect a
/// data-channel handshake carrying `transient_id` and the enclosed CEK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenDataConnectionBody {
    pub transient_id: TransientConnectionId,
    pub cek_key: Vec<u8>,
    pub cek_iv: Vec<u8>,
    pub cipher: CipherKind,
    pub mode: CipherMode,
    pub encrypt: bool,
    pub compress: bool,
}

/// Encodes a wire record.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_cbor::to_vec(value).map_err(|e| NetError::Decode(format!("encode: {e}")))
}

/// Decodes a wire record, mapping malformed input to [`NetError::Decode`].
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    serde_cbor::from_slice(bytes).map_err(|e| NetError::Decode(format!("decode: {e}")))
}
