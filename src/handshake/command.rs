//! Command-channel handshake.
//!
//! Establishes the per-channel content encryption key (CEK) under the
//! protection of the peer's long-term key: RSA sign-then-encrypt, or AEAD
//! under an ECDH-derived key whose IV travels in cleartext. The acceptor
//! proves itself by echoing the request signature and presenting the pair's
//! authentication password, both under the new CEK.

use tracing::info;

use crate::crypto::SymmetricHandler;
use crate::device::DeviceDescriptor;
use crate::error::{NetError, Result};
use crate::messages::{
    decode, encode, CmdRequest, CmdRequestInner, CmdResponse, KeyExchangeKind, PeerRole,
    RequestSignature,
};

use super::{
    log_handshake_failure, HandshakeFailure, HandshakeIo, HandshakeServices, HandshakeState,
    HandshakeSuccess,
};

pub struct CommandHandshake<'a, S: HandshakeServices> {
    services: &'a S,
    io: HandshakeIo,
    state: HandshakeState,
}

impl<'a, S: HandshakeServices> CommandHandshake<'a, S> {
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
        pending_device: Option<crate::messages::DeviceId>,
    ) -> HandshakeFailure {
        self.state = HandshakeState::Failed;
        if let Some(device_id) = pending_device {
            self.services.connection_store().discard_command(device_id);
        }
        self.io.disconnect();
        log_handshake_failure("command", self.state, &error);
        HandshakeFailure {
            error,
            state: self.state,
        }
    }

    /// Initiator path, run after dialing the peer's command endpoint.
    pub async fn run_local(
        mut self,
        descriptor: DeviceDescriptor,
    ) -> std::result::Result<HandshakeSuccess, HandshakeFailure> {
        let device_id = descriptor.device_id;
        match self.drive_local(&descriptor).await {
            Ok(cek) => {
                self.services.connection_store().discard_command(device_id);
                self.io.connection().disable_events();
                info!(
                    target: "syncnet::handshake",
                    device = %device_id,
                    "command channel negotiated (initiator)"
                );
                let (connection, events) = self.io.into_parts();
                Ok(HandshakeSuccess {
                    device_id,
                    transient_id: None,
                    connection,
                    events,
                    handler: cek,
                    encrypt: true,
                    compress: false,
                })
            }
            Err(error) => Err(self.fail(error, Some(device_id))),
        }
    }

    /// Acceptor path, run on a connection accepted at the command endpoint.
    pub async fn run_remote(mut self) -> std::result::Result<HandshakeSuccess, HandshakeFailure> {
        match self.drive_remote().await {
            Ok((cek, device_id)) => {
                self.io.connection().disable_events();
                info!(
                    target: "syncnet::handshake",
                    device = %device_id,
                    "command channel negotiated (acceptor)"
                );
                let (connection, events) = self.io.into_parts();
                Ok(HandshakeSuccess {
                    device_id,
                    transient_id: None,
                    connection,
                    events,
                    handler: cek,
                    encrypt: true,
                    compress: false,
                })
            }
            Err(error) => Err(self.fail(error, None)),
        }
    }

    async fn drive_local(&mut self, descriptor: &DeviceDescriptor) -> Result<SymmetricHandler> {
        let config = self.services.network_config();
        let crypto = self.services.crypto();
        let local = self.services.local_identity();

        let cek_data = crypto.new_symmetric_data(config.default_cipher, config.default_mode);
        let cek = crypto.bind_symmetric(
            &cek_data.key,
            &cek_data.iv,
            config.default_cipher,
            config.default_mode,
        )?;
        let signature = RequestSignature::generate(RequestSignature::DEFAULT_LENGTH);

        let password_data = if local.role == PeerRole::Server {
            Some(
                self.services
                    .authentication()
                    .entry(descriptor.device_id)
                    .await?
                    .plaintext_password,
            )
        } else {
            None
        };

        let inner = CmdRequestInner {
            cipher: config.default_cipher,
            mode: config.default_mode,
            request_signature: signature.to_bytes()?,
            cek_key: cek_data.key.clone(),
            cek_iv: cek_data.iv.clone(),
            password_data,
        };
        let inner_bytes = encode(&inner)?;

        let (data, ecdh_iv) = match descriptor.key_exchange {
            KeyExchangeKind::Rsa => {
                let signed = crypto.sign_with_private(local.rsa_private()?, &inner_bytes)?;
                (
                    crypto.encrypt_with_public(&descriptor.public_key, &signed)?,
                    None,
                )
            }
            KeyExchangeKind::Ecdh => {
                let (kek, iv) =
                    crypto.ecdh_derive(local.ecdh_secret(), &descriptor.public_key, None)?;
                (kek.encrypt(&inner_bytes)?, Some(iv))
            }
        };

        let request = CmdRequest {
            peer_id: local.device_id,
            data,
            ecdh_iv,
        };
        self.io.send(encode(&request)?);
        self.transition(HandshakeState::RequestSent)?;
        self.io.await_write_ack().await?;
        self.transition(HandshakeState::RequestAcknowledged)?;

        let frame = self.io.recv_frame().await?;
        self.transition(HandshakeState::ResponseReceived)?;
        let response: CmdResponse = decode(&cek.decrypt(&frame)?)?;

        let echoed = RequestSignature::from_bytes(&response.request_signature)?;
        if !echoed.matches(&signature) {
            return Err(NetError::Auth("request signature mismatch".into()));
        }
        let expected = self
            .services
            .authentication()
            .entry(descriptor.device_id)
            .await?
            .plaintext_password;
        if response.password_data != expected {
            return Err(NetError::Auth("peer password mismatch".into()));
        }

        self.transition(HandshakeState::Completed)?;
        Ok(cek)
    }

    async fn drive_remote(&mut self) -> Result<(SymmetricHandler, crate::messages::DeviceId)> {
        let crypto = self.services.crypto();
        let local = self.services.local_identity();

        let frame = self.io.recv_frame().await?;
        let request: CmdRequest = decode(&frame)?;
        let descriptor = self.services.directory().device(request.peer_id).await?;

        let inner_bytes = match descriptor.key_exchange {
            KeyExchangeKind::Rsa => {
                let signed = crypto.decrypt_with_private(local.rsa_private()?, &request.data)?;
                crypto.verify_and_recover_with_public(&descriptor.public_key, &signed)?
            }
            KeyExchangeKind::Ecdh => {
                let iv = request
                    .ecdh_iv
                    .ok_or_else(|| NetError::Decode("missing ecdh iv".into()))?;
                let (kek, _) =
                    crypto.ecdh_derive(local.ecdh_secret(), &descriptor.public_key, Some(iv))?;
                kek.decrypt(&request.data)?
            }
        };
        let inner: CmdRequestInner = decode(&inner_bytes)?;
        RequestSignature::from_bytes(&inner.request_signature)?;

        let cek = crypto.bind_symmetric(&inner.cek_key, &inner.cek_iv, inner.cipher, inner.mode)?;

        let expected = self
            .services
            .authentication()
            .entry(descriptor.device_id)
            .await?
            .plaintext_password;
        if descriptor.role == PeerRole::Server {
            let presented = inner
                .password_data
                .ok_or_else(|| NetError::Auth("peer password required".into()))?;
            if presented != expected {
                return Err(NetError::Auth("peer password mismatch".into()));
            }
        }

        let response = CmdResponse {
            request_signature: inner.request_signature.clone(),
            password_data: expected,
        };
        self.io.send(cek.encrypt(&encode(&response)?)?);
        self.transition(HandshakeState::ResponseSent)?;
        self.io.await_write_ack().await?;

        self.transition(HandshakeState::Completed)?;
        Ok((cek, descriptor.device_id))
    }
}
