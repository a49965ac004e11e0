//! Initial-setup (pairing) handshake.
//!
//! A shared human-entered password plus a transient id chosen by the
//! initiator are transformed into mutual knowledge of long-term identities,
//! public keys, endpoints, and, when a SERVER-role peer is involved, a newly
//! generated authentication password. The connection is one-shot and is torn
//! down after completion.

use tracing::{debug, info};

use crate::crypto::PasswordDerivation;
use crate::device::{DeviceDescriptor, LocalAuthenticationEntry};
use crate::error::{NetError, Result};
use crate::messages::{
    decode, encode, DeviceId, PeerRole, RequestSignature, SetupAdditional, SetupRequest,
    SetupResponse,
};
use crate::password::generate_password;
use crate::store::PendingInitSetup;

use super::{
    log_handshake_failure, HandshakeFailure, HandshakeIo, HandshakeServices, HandshakeState,
};

/// Identity learned from a completed pairing.
#[derive(Debug, Clone)]
pub struct InitOutcome {
    pub device_id: DeviceId,
}

pub struct InitHandshake<'a, S: HandshakeServices> {
    services: &'a S,
    io: HandshakeIo,
    state: HandshakeState,
}

impl<'a, S: HandshakeServices> InitHandshake<'a, S> {
    pub fn new(io: HandshakeIo, services: &'a S) -> Self {
        Self {
            services,
            io,
            state: HandshakeState::Initiated,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn transition(&mut self, next: HandshakeState) -> Result<()> {
        self.state = self.state.advance(next)?;
        Ok(())
    }

    fn fail(
        &mut self,
        error: NetError,
        transient_id: Option<u64>,
    ) -> HandshakeFailure {
        self.state = HandshakeState::Failed;
        if let Some(transient_id) = transient_id {
            self.services.connection_store().discard_init(transient_id);
        }
        self.io.disconnect();
        log_handshake_failure("init", self.state, &error);
        HandshakeFailure {
            error,
            state: self.state,
        }
    }

    /// Initiator path: runs after this side dialed the peer's init endpoint.
    pub async fn run_local(
        mut self,
        pending: PendingInitSetup,
    ) -> std::result::Result<InitOutcome, HandshakeFailure> {
        let transient_id = pending.transient_id;
        match self.drive_local(pending).await {
            Ok(outcome) => {
                self.services.connection_store().discard_init(transient_id);
                self.io.disconnect();
                info!(
                    target: "syncnet::handshake",
                    device = %outcome.device_id,
                    "pairing completed (initiator)"
                );
                Ok(outcome)
            }
            Err(error) => Err(self.fail(error, Some(transient_id))),
        }
    }

    /// Acceptor path: runs on a connection accepted at the init endpoint.
    pub async fn run_remote(mut self) -> std::result::Result<InitOutcome, HandshakeFailure> {
        let mut transient_id = None;
        match self.drive_remote(&mut transient_id).await {
            Ok(outcome) => {
                if let Some(transient_id) = transient_id {
                    self.services.connection_store().discard_init(transient_id);
                }
                self.io.disconnect();
                info!(
                    target: "syncnet::handshake",
                    device = %outcome.device_id,
                    "pairing completed (acceptor)"
                );
                Ok(outcome)
            }
            Err(error) => Err(self.fail(error, transient_id)),
        }
    }

    async fn drive_local(&mut self, pending: PendingInitSetup) -> Result<InitOutcome> {
        let config = self.services.network_config();
        let crypto = self.services.crypto();
        let local = self.services.local_identity();

        let (handler, params) = crypto.derive_symmetric_from_password(
            &pending.shared_password,
            None,
            config.pbkdf2_iterations,
            config.default_cipher,
            config.default_mode,
        )?;

        let signature = RequestSignature::generate(RequestSignature::DEFAULT_LENGTH);
        let generated_password = (pending.remote_role == PeerRole::Server)
            .then(|| generate_password(config.generated_password_length));

        let endpoints = self.services.local_endpoints();
        let additional = SetupAdditional {
            request_signature: signature.to_bytes()?,
            public_key: local.public_key_bytes()?,
            command_addr: endpoints.command.0.clone(),
            command_port: endpoints.command.1,
            data_addr: endpoints.data.0.clone(),
            data_port: endpoints.data.1,
            init_addr: endpoints.init.0.clone(),
            init_port: endpoints.init.1,
            key_exchange: local.key_exchange,
            remote_peer_id: pending.new_device_id,
            local_peer_id: (local.role != PeerRole::Server).then_some(local.device_id),
            password_data: generated_password.clone(),
        };

        let request = SetupRequest {
            pbkd_salt: params.salt,
            pbkd_iv: params.iv,
            pbkd_iterations: params.iterations,
            pbkd_cipher: params.cipher,
            pbkd_mode: params.mode,
            transient_id: pending.transient_id,
            additional_data: handler.encrypt(&encode(&additional)?)?,
        };

        self.io.send(encode(&request)?);
        self.transition(HandshakeState::RequestSent)?;
        self.io.await_write_ack().await?;
        self.transition(HandshakeState::RequestAcknowledged)?;

        let frame = self.io.recv_frame().await?;
        self.transition(HandshakeState::ResponseReceived)?;
        let response: SetupResponse = decode(&frame)?;
        let mirrored: SetupAdditional = decode(&handler.decrypt(&response.additional_data)?)?;

        let echoed = RequestSignature::from_bytes(&mirrored.request_signature)?;
        if !echoed.matches(&signature) {
            return Err(NetError::Auth("request signature mismatch".into()));
        }
        validate_additional(&mirrored, pending.remote_role, local.role)?;

        self.persist(&pending, &mirrored, generated_password, false)
            .await?;
        self.transition(HandshakeState::Completed)?;
        Ok(InitOutcome {
            device_id: pending.new_device_id,
        })
    }

    async fn drive_remote(&mut self, seen_transient: &mut Option<u64>) -> Result<InitOutcome> {
        let config = self.services.network_config();
        let crypto = self.services.crypto();
        let local = self.services.local_identity();

        let frame = self.io.recv_frame().await?;
        let request: SetupRequest = decode(&frame)?;
        *seen_transient = Some(request.transient_id);

        let pending = self
            .services
            .connection_store()
            .init_by_transient(request.transient_id)?;

        let (handler, _) = crypto.derive_symmetric_from_password(
            &pending.shared_password,
            Some(PasswordDerivation {
                salt: request.pbkd_salt,
                iv: request.pbkd_iv,
                iterations: request.pbkd_iterations,
                cipher: request.pbkd_cipher,
                mode: request.pbkd_mode,
            }),
            config.pbkdf2_iterations,
            config.default_cipher,
            config.default_mode,
        )?;

        let additional: SetupAdditional = decode(&handler.decrypt(&request.additional_data)?)?;
        // Checked for well-formedness even though only echoed back.
        RequestSignature::from_bytes(&additional.request_signature)?;
        validate_additional(&additional, pending.remote_role, local.role)?;
        debug!(
            target: "syncnet::handshake",
            transient = request.transient_id,
            "pairing request validated"
        );

        let generated_password = (pending.remote_role == PeerRole::Server)
            .then(|| generate_password(config.generated_password_length));

        let endpoints = self.services.local_endpoints();
        let mirrored = SetupAdditional {
            request_signature: additional.request_signature.clone(),
            public_key: local.public_key_bytes()?,
            command_addr: endpoints.command.0.clone(),
            command_port: endpoints.command.1,
            data_addr: endpoints.data.0.clone(),
            data_port: endpoints.data.1,
            init_addr: endpoints.init.0.clone(),
            init_port: endpoints.init.1,
            key_exchange: local.key_exchange,
            remote_peer_id: pending.new_device_id,
            local_peer_id: (local.role != PeerRole::Server).then_some(local.device_id),
            password_data: generated_password.clone(),
        };
        let response = SetupResponse {
            additional_data: handler.encrypt(&encode(&mirrored)?)?,
        };

        self.io.send(encode(&response)?);
        self.transition(HandshakeState::ResponseSent)?;
        self.io.await_write_ack().await?;

        self.persist(&pending, &additional, generated_password, true)
            .await?;
        self.transition(HandshakeState::Completed)?;
        Ok(InitOutcome {
            device_id: pending.new_device_id,
        })
    }

    /// Writes the learned descriptor and the pair's authentication password.
    ///
    /// When both sides generated a password (server-to-server pairing), the
    /// initiator-generated one is canonical on both ends; the acceptor
    /// therefore prefers the received value over its own.
    async fn persist(
        &self,
        pending: &PendingInitSetup,
        received: &SetupAdditional,
        generated_password: Option<String>,
        prefer_received: bool,
    ) -> Result<()> {
        let descriptor = DeviceDescriptor {
            device_id: pending.new_device_id,
            owner: pending.owner,
            role: pending.remote_role,
            command_addr: received.command_addr.clone(),
            command_port: received.command_port,
            data_addr: received.data_addr.clone(),
            data_port: received.data_port,
            init_addr: received.init_addr.clone(),
            init_port: received.init_port,
            public_key: received.public_key.clone(),
            key_exchange: received.key_exchange,
        };
        self.services.directory().update(descriptor).await?;

        let canonical = if prefer_received {
            received
                .password_data
                .clone()
                .or(generated_password)
        } else {
            generated_password.or_else(|| received.password_data.clone())
        };
        if let Some(password) = canonical {
            self.services
                .authentication()
                .put(LocalAuthenticationEntry {
                    remote_device_id: pending.new_device_id,
                    plaintext_password: password,
                })
                .await?;
        }
        Ok(())
    }
}

/// Field-presence rules shared by both directions.
///
/// `sender_role` is the role of the peer that produced the payload,
/// `receiver_role` the role of the side validating it.
fn validate_additional(
    additional: &SetupAdditional,
    sender_role: PeerRole,
    receiver_role: PeerRole,
) -> Result<()> {
    if receiver_role == PeerRole::Server && additional.password_data.is_none() {
        return Err(NetError::Decode(
            "password data is mandatory when the receiver is a server".into(),
        ));
    }
    if sender_role != PeerRole::Server && additional.local_peer_id.is_none() {
        return Err(NetError::Decode(
            "peer id is mandatory for non-server senders".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn additional(local_peer_id: Option<Uuid>, password_data: Option<String>) -> SetupAdditional {
        SetupAdditional {
            request_signature: vec![0; 4],
            public_key: vec![1; 32],
            command_addr: "127.0.0.1".into(),
            command_port: 9001,
            data_addr: "127.0.0.1".into(),
            data_port: 9002,
            init_addr: "127.0.0.1".into(),
            init_port: 9003,
            key_exchange: crate::messages::KeyExchangeKind::Ecdh,
            remote_peer_id: Uuid::new_v4(),
            local_peer_id,
            password_data,
        }
    }

    #[test]
    fn missing_password_for_server_receiver_is_rejected() {
        let payload = additional(Some(Uuid::new_v4()), None);
        assert!(matches!(
            validate_additional(&payload, PeerRole::Client, PeerRole::Server),
            Err(NetError::Decode(_))
        ));
    }

    #[test]
    fn missing_peer_id_for_client_sender_is_rejected() {
        let payload = additional(None, Some("secret".into()));
        assert!(matches!(
            validate_additional(&payload, PeerRole::Client, PeerRole::Server),
            Err(NetError::Decode(_))
        ));
    }

    #[test]
    fn server_sender_may_omit_peer_id() {
        let payload = additional(None, None);
        validate_additional(&payload, PeerRole::Server, PeerRole::Client).unwrap();
    }
}
