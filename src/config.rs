use std::time::Duration;

use serde::Deserialize;

use crate::error::NetError;
use crate::messages::{CipherKind, CipherMode};

/// Runtime knobs for the connection core.
///
/// All timer floors are policy, not protocol; peers with different values
/// interoperate. The struct is immutable once handed to the coordinator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Frame ceiling for both send and accumulated receive, in bytes.
    pub max_data_size: usize,
    /// Fragment size for `data_received` delivery.
    pub read_chunk_size: usize,
    /// Completion floor for pairing handshakes.
    pub setup_timeout_init: Duration,
    /// Completion floor for command-channel handshakes.
    pub setup_timeout_command: Duration,
    /// Completion floor for data-channel handshakes.
    pub setup_timeout_data: Duration,
    /// Tick period of the per-channel inactivity check.
    pub inactivity_interval: Duration,
    /// Discard floor for pending-init entries created by an outbound dial.
    pub discard_pending_init_local: Duration,
    /// Discard floor for pending-init entries awaiting an inbound peer.
    pub discard_pending_init_remote: Duration,
    /// Discard floor for pending command-connection descriptors.
    pub discard_pending_command: Duration,
    /// Discard floor for pending data-channel descriptors.
    pub discard_pending_data: Duration,
    /// PBKDF2 iteration count for password-derived keys.
    pub pbkdf2_iterations: u32,
    /// Length of passwords generated for newly paired server peers.
    pub generated_password_length: usize,
    /// Cipher used for freshly negotiated content encryption keys.
    pub default_cipher: CipherKind,
    /// Mode used for freshly negotiated content encryption keys.
    pub default_mode: CipherMode,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_data_size: 16 * 1024 * 1024,
            read_chunk_size: 64 * 1024,
            setup_timeout_init: Duration::from_secs(30),
            setup_timeout_command: Duration::from_secs(10),
            setup_timeout_data: Duration::from_secs(10),
            inactivity_interval: Duration::from_secs(60),
            discard_pending_init_local: Duration::from_secs(45),
            discard_pending_init_remote: Duration::from_secs(90),
            discard_pending_command: Duration::from_secs(30),
            discard_pending_data: Duration::from_secs(30),
            pbkdf2_iterations: 120_000,
            generated_password_length: 16,
            default_cipher: CipherKind::Aes,
            default_mode: CipherMode::Gcm,
        }
    }
}

impl NetworkConfig {
    /// Validates the size parameters.
    ///
    /// A zero ceiling or a read chunk larger than the ceiling would make the
    /// framed reader unable to deliver a single full frame.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.max_data_size == 0 {
            return Err(NetError::Config("max_data_size must be non-zero".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(NetError::Config("read_chunk_size must be non-zero".into()));
        }
        if self.read_chunk_size > self.max_data_size {
            return Err(NetError::Config(
                "read_chunk_size cannot exceed max_data_size".into(),
            ));
        }
        if self.generated_password_length == 0 {
            return Err(NetError::Config(
                "generated_password_length must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        NetworkConfig::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn zero_ceiling_rejected() {
        let config = NetworkConfig {
            max_data_size: 0,
            ..NetworkConfig::default()
        };
        assert!(matches!(config.validate(), Err(NetError::Config(_))));
    }

    #[test]
    fn chunk_larger_than_ceiling_rejected() {
        let config = NetworkConfig {
            max_data_size: 1024,
            read_chunk_size: 2048,
            ..NetworkConfig::default()
        };
        assert!(matches!(config.validate(), Err(NetError::Config(_))));
    }
}
