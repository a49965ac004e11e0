//! Data-channel handshake.
//!
//! The CEK was already delivered over the command channel; this exchange
//! only proves both sides hold it. The initiator names the transient id, the
//! acceptor consumes the matching pending descriptor, and each direction
//! validates a CEK-encrypted request signature.

use tracing::info;

use crate::crypto::SymmetricHandler;
use crate::error::{NetError, Result};
use crate::messages::{decode, encode, DataRequest, DataResponse, RequestSignature};
use crate::store::PendingDataChannel;

use super::{
    log_handshake_failure, HandshakeFailure, HandshakeIo, HandshakeServices, HandshakeState,
    HandshakeSuccess,
};

pub struct DataHandshake<'a, S: HandshakeServices> {
    services: &'a S,
    io: HandshakeIo,
    state: HandshakeState,
}

impl<'a, S: HandshakeServices> DataHandshake<'a, S> {
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

    fn fail(&mut self, error: NetError) -> HandshakeFailure {
        self.state = HandshakeState::Failed;
        self.io.disconnect();
        log_handshake_failure("data", self.state, &error);
        HandshakeFailure {
            error,
            state: self.state,
        }
    }

    /// Initiator path; `pending` was consumed from the store at dispatch.
    pub async fn run_local(
        mut self,
        pending: PendingDataChannel,
    ) -> std::result::Result<HandshakeSuccess, HandshakeFailure> {
        match self.drive_local(&pending).await {
            Ok(cek) => Ok(self.promote(pending, cek, "initiator")),
            Err(error) => Err(self.fail(error)),
        }
    }

    /// Acceptor path; the pending descriptor is found (and consumed) by the
    /// (peer id, transient id) carried in the request.
    pub async fn run_remote(mut self) -> std::result::Result<HandshakeSuccess, HandshakeFailure> {
        match self.drive_remote().await {
            Ok((pending, cek)) => Ok(self.promote(pending, cek, "acceptor")),
            Err(error) => Err(self.fail(error)),
        }
    }

    fn promote(
        self,
        pending: PendingDataChannel,
        handler: SymmetricHandler,
        side: &str,
    ) -> HandshakeSuccess {
        self.io.connection().disable_events();
        info!(
            target: "syncnet::handshake",
            device = %pending.device.device_id,
            transient = pending.transient_id,
            side,
            "data channel negotiated"
        );
        let (connection, events) = self.io.into_parts();
        HandshakeSuccess {
            device_id: pending.device.device_id,
            transient_id: Some(pending.transient_id),
            connection,
            events,
            handler,
            encrypt: pending.encrypt,
            compress: pending.compress,
        }
    }

    async fn drive_local(&mut self, pending: &PendingDataChannel) -> Result<SymmetricHandler> {
        let crypto = self.services.crypto();
        let local = self.services.local_identity();
        let cek = crypto.bind_symmetric(
            &pending.cek_key,
            &pending.cek_iv,
            pending.cipher,
            pending.mode,
        )?;

        let signature = RequestSignature::generate(RequestSignature::DEFAULT_LENGTH);
        let request = DataRequest {
            peer_id: local.device_id,
            transient_id: pending.transient_id,
            request_signature: cek.encrypt(&signature.to_bytes()?)?,
        };
        self.io.send(encode(&request)?);
        self.transition(HandshakeState::RequestSent)?;
        self.io.await_write_ack().await?;
        self.transition(HandshakeState::RequestAcknowledged)?;

        let frame = self.io.recv_frame().await?;
        self.transition(HandshakeState::ResponseReceived)?;
        let response: DataResponse = decode(&frame)?;
        let echoed = RequestSignature::from_bytes(&cek.decrypt(&response.request_signature)?)?;
        if !echoed.matches(&signature) {
            return Err(NetError::Auth("request signature mismatch".into()));
        }

        self.transition(HandshakeState::Completed)?;
        Ok(cek)
    }

    async fn drive_remote(&mut self) -> Result<(PendingDataChannel, SymmetricHandler)> {
        let crypto = self.services.crypto();

        let frame = self.io.recv_frame().await?;
        let request: DataRequest = decode(&frame)?;

        // This lookup consumes the entry; a second handshake for the same
        // pair misses.
        let pending = self
            .services
            .connection_store()
            .take_data(request.peer_id, request.transient_id)?;

        let cek = crypto.bind_symmetric(
            &pending.cek_key,
            &pending.cek_iv,
            pending.cipher,
            pending.mode,
        )?;
        let signature = RequestSignature::from_bytes(&cek.decrypt(&request.request_signature)?)?;

        let response = DataResponse {
            request_signature: cek.encrypt(&signature.to_bytes()?)?,
        };
        self.io.send(encode(&response)?);
        self.transition(HandshakeState::ResponseSent)?;
        self.io.await_write_ack().await?;

        self.transition(HandshakeState::Completed)?;
        Ok((pending, cek))
    }
}
