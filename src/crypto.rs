//! Crypto service façade consumed by the handshakes.
//!
//! The primitives themselves come from the RustCrypto AEAD family plus
//! `rsa`/`x25519-dalek`; this module only binds them to the wire vocabulary
//! (cipher kind, mode, key-exchange kind) and normalizes failures into the
//! crate taxonomy. Handlers are immutable after construction and freely
//! shared by reference.

use std::fmt;

use aead::generic_array::GenericArray;
use aead::{Aead, KeyInit};
use aes::Aes256;
use aes_gcm::Aes256Gcm;
use ccm::consts::{U12, U16};
use ccm::Ccm;
use eax::Eax;
use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serpent::Serpent;
use sha2::{Digest, Sha256};
use twofish::Twofish;
use x25519_dalek::{PublicKey as EcdhPublicKey, StaticSecret};

use crate::error::{NetError, Result};
use crate::messages::{CipherKind, CipherMode, DeviceId, KeyExchangeKind, PeerRole};

type AesCcm = Ccm<Aes256, U16, U12>;
type TwofishCcm = Ccm<Twofish, U16, U12>;
type SerpentCcm = Ccm<Serpent, U16, U12>;

const ECDH_PUBLIC_LENGTH: usize = 32;
const KEK_INFO: &[u8] = b"syncnet content key wrap";

/// Freshly generated symmetric key material.
#[derive(Clone)]
pub struct SymmetricData {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

/// Parameters of a password-based key derivation.
///
/// Carried inside pairing requests so the acceptor can derive the same key;
/// discarded once the handler is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordDerivation {
    pub salt: Vec<u8>,
    pub iv: Vec<u8>,
    pub iterations: u32,
    pub cipher: CipherKind,
    pub mode: CipherMode,
}

enum AeadImpl {
    AesGcm(Aes256Gcm),
    AesCcm(AesCcm),
    AesEax(Eax<Aes256>),
    TwofishCcm(TwofishCcm),
    TwofishEax(Eax<Twofish>),
    SerpentCcm(SerpentCcm),
    SerpentEax(Eax<Serpent>),
}

/// AEAD handler bound to one (cipher, mode, key, iv) tuple.
///
/// Decryption of tampered input fails with [`NetError::Auth`].
pub struct SymmetricHandler {
    cipher: CipherKind,
    mode: CipherMode,
    iv: Vec<u8>,
    aead: AeadImpl,
}

impl fmt::Debug for SymmetricHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricHandler")
            .field("cipher", &self.cipher)
            .field("mode", &self.mode)
            .finish()
    }
}

impl SymmetricHandler {
    pub fn cipher(&self) -> CipherKind {
        self.cipher
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = &self.iv;
        let sealed = match &self.aead {
            AeadImpl::AesGcm(a) => a.encrypt(GenericArray::from_slice(nonce), plaintext),
            AeadImpl::AesCcm(a) => a.encrypt(GenericArray::from_slice(nonce), plaintext),
            AeadImpl::AesEax(a) => a.encrypt(GenericArray::from_slice(nonce), plaintext),
            AeadImpl::TwofishCcm(a) => a.encrypt(GenericArray::from_slice(nonce), plaintext),
            AeadImpl::TwofishEax(a) => a.encrypt(GenericArray::from_slice(nonce), plaintext),
            AeadImpl::SerpentCcm(a) => a.encrypt(GenericArray::from_slice(nonce), plaintext),
            AeadImpl::SerpentEax(a) => a.encrypt(GenericArray::from_slice(nonce), plaintext),
        };
        sealed.map_err(|_| NetError::Auth("aead encryption failed".into()))
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = &self.iv;
        let opened = match &self.aead {
            AeadImpl::AesGcm(a) => a.decrypt(GenericArray::from_slice(nonce), ciphertext),
            AeadImpl::AesCcm(a) => a.decrypt(GenericArray::from_slice(nonce), ciphertext),
            AeadImpl::AesEax(a) => a.decrypt(GenericArray::from_slice(nonce), ciphertext),
            AeadImpl::TwofishCcm(a) => a.decrypt(GenericArray::from_slice(nonce), ciphertext),
            AeadImpl::TwofishEax(a) => a.decrypt(GenericArray::from_slice(nonce), ciphertext),
            AeadImpl::SerpentCcm(a) => a.decrypt(GenericArray::from_slice(nonce), ciphertext),
            AeadImpl::SerpentEax(a) => a.decrypt(GenericArray::from_slice(nonce), ciphertext),
        };
        opened.map_err(|_| NetError::Auth("aead authentication failed".into()))
    }
}

/// Key length in bytes for the given cipher.
pub fn key_length(cipher: CipherKind) -> usize {
    match cipher {
        CipherKind::Aes => 32,
        CipherKind::Twofish => 32,
        CipherKind::Serpent => 16,
    }
}

/// Nonce length in bytes for the given mode.
pub fn iv_length(mode: CipherMode) -> usize {
    match mode {
        CipherMode::Gcm | CipherMode::Ccm => 12,
        CipherMode::Eax => 16,
    }
}

#[derive(Serialize, Deserialize)]
struct SignedEnvelope {
    signature: Vec<u8>,
    message: Vec<u8>,
}

/// Stateless façade over the crypto primitives.
#[derive(Debug, Default, Clone)]
pub struct CryptoService;

impl CryptoService {
    pub fn new() -> Self {
        Self
    }

    /// Generates a fresh key and IV sized for the given cipher and mode.
    pub fn new_symmetric_data(&self, cipher: CipherKind, mode: CipherMode) -> SymmetricData {
        let mut key = vec![0_u8; key_length(cipher)];
        let mut iv = vec![0_u8; iv_length(mode)];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        SymmetricData { key, iv }
    }

    /// Binds an AEAD handler to existing key material.
    ///
    /// GCM is only defined for AES here; TWOFISH/SERPENT with GCM is a
    /// configuration error.
    pub fn bind_symmetric(
        &self,
        key: &[u8],
        iv: &[u8],
        cipher: CipherKind,
        mode: CipherMode,
    ) -> Result<SymmetricHandler> {
        if key.len() != key_length(cipher) {
            return Err(NetError::Config(format!(
                "invalid key length {} for {:?}",
                key.len(),
                cipher
            )));
        }
        if iv.len() != iv_length(mode) {
            return Err(NetError::Config(format!(
                "invalid iv length {} for {:?}",
                iv.len(),
                mode
            )));
        }
        let invalid = |_| NetError::Config("aead key rejected".into());
        let aead = match (cipher, mode) {
            (CipherKind::Aes, CipherMode::Gcm) => {
                AeadImpl::AesGcm(Aes256Gcm::new_from_slice(key).map_err(invalid)?)
            }
            (CipherKind::Aes, CipherMode::Ccm) => {
                AeadImpl::AesCcm(AesCcm::new_from_slice(key).map_err(invalid)?)
            }
            (CipherKind::Aes, CipherMode::Eax) => {
                AeadImpl::AesEax(Eax::<Aes256>::new_from_slice(key).map_err(invalid)?)
            }
            (CipherKind::Twofish, CipherMode::Ccm) => {
                AeadImpl::TwofishCcm(TwofishCcm::new_from_slice(key).map_err(invalid)?)
            }
            (CipherKind::Twofish, CipherMode::Eax) => {
                AeadImpl::TwofishEax(Eax::<Twofish>::new_from_slice(key).map_err(invalid)?)
            }
            (CipherKind::Serpent, CipherMode::Ccm) => {
                AeadImpl::SerpentCcm(SerpentCcm::new_from_slice(key).map_err(invalid)?)
            }
            (CipherKind::Serpent, CipherMode::Eax) => {
                AeadImpl::SerpentEax(Eax::<Serpent>::new_from_slice(key).map_err(invalid)?)
            }
            (kind, CipherMode::Gcm) => {
                return Err(NetError::Config(format!(
                    "GCM is not available for {kind:?}"
                )));
            }
        };
        Ok(SymmetricHandler {
            cipher,
            mode,
            iv: iv.to_vec(),
            aead,
        })
    }

    /// Derives a handler from a password.
    ///
    /// When `params` is absent, fresh salt/IV and the supplied defaults are
    /// used; the returned [`PasswordDerivation`] is what the peer needs to
    /// derive the same key.
    pub fn derive_symmetric_from_password(
        &self,
        password: &str,
        params: Option<PasswordDerivation>,
        default_iterations: u32,
        default_cipher: CipherKind,
        default_mode: CipherMode,
    ) -> Result<(SymmetricHandler, PasswordDerivation)> {
        let params = match params {
            Some(params) => params,
            None => {
                let mut salt = vec![0_u8; 16];
                OsRng.fill_bytes(&mut salt);
                let mut iv = vec![0_u8; iv_length(default_mode)];
                OsRng.fill_bytes(&mut iv);
                PasswordDerivation {
                    salt,
                    iv,
                    iterations: default_iterations,
                    cipher: default_cipher,
                    mode: default_mode,
                }
            }
        };
        if params.iterations == 0 {
            return Err(NetError::Config("pbkdf2 iteration count is zero".into()));
        }
        let mut key = vec![0_u8; key_length(params.cipher)];
        pbkdf2_hmac::<Sha256>(
            password.as_bytes(),
            &params.salt,
            params.iterations,
            &mut key,
        );
        let handler = self.bind_symmetric(&key, &params.iv, params.cipher, params.mode)?;
        Ok((handler, params))
    }

    /// Derives a key-encryption handler from an X25519 exchange.
    ///
    /// Both peers call this with their own secret and the other's public key
    /// and obtain the same handler. The IV is generated when absent and must
    /// travel to the peer in cleartext.
    pub fn ecdh_derive(
        &self,
        local_secret: &[u8; 32],
        remote_public: &[u8],
        iv: Option<Vec<u8>>,
    ) -> Result<(SymmetricHandler, Vec<u8>)> {
        let public: [u8; ECDH_PUBLIC_LENGTH] = remote_public
            .try_into()
            .map_err(|_| NetError::Decode("ecdh public key must be 32 bytes".into()))?;
        let secret = StaticSecret::from(*local_secret);
        let shared = secret.diffie_hellman(&EcdhPublicKey::from(public));
        let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key = [0_u8; 32];
        hkdf.expand(KEK_INFO, &mut key)
            .map_err(|_| NetError::Config("hkdf expand failed".into()))?;
        let iv = match iv {
            Some(iv) => iv,
            None => {
                let mut fresh = vec![0_u8; iv_length(CipherMode::Gcm)];
                OsRng.fill_bytes(&mut fresh);
                fresh
            }
        };
        let handler = self.bind_symmetric(&key, &iv, CipherKind::Aes, CipherMode::Gcm)?;
        Ok((handler, iv))
    }

    /// Signs `message` and returns a recoverable envelope (signature plus
    /// the message itself).
    pub fn sign_with_private(&self, key: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(message);
        let signature = key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| NetError::Auth(format!("rsa signing failed: {e}")))?;
        crate::messages::encode(&SignedEnvelope {
            signature,
            message: message.to_vec(),
        })
    }

    /// Verifies a recoverable envelope and returns the embedded message.
    pub fn verify_and_recover_with_public(
        &self,
        public_key_der: &[u8],
        signed: &[u8],
    ) -> Result<Vec<u8>> {
        let key = RsaPublicKey::from_pkcs1_der(public_key_der)
            .map_err(|e| NetError::Decode(format!("rsa public key: {e}")))?;
        let envelope: SignedEnvelope = crate::messages::decode(signed)?;
        let digest = Sha256::digest(&envelope.message);
        key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &envelope.signature)
            .map_err(|_| NetError::Auth("rsa signature mismatch".into()))?;
        Ok(envelope.message)
    }

    /// Public-key encryption of arbitrary-length input, chunked to the
    /// modulus size.
    pub fn encrypt_with_public(&self, public_key_der: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = RsaPublicKey::from_pkcs1_der(public_key_der)
            .map_err(|e| NetError::Decode(format!("rsa public key: {e}")))?;
        let chunk_size = key.size() - 11;
        let mut sealed = Vec::with_capacity(plaintext.len() + key.size());
        for chunk in plaintext.chunks(chunk_size) {
            let block = key
                .encrypt(&mut OsRng, Pkcs1v15Encrypt, chunk)
                .map_err(|e| NetError::Auth(format!("rsa encryption failed: {e}")))?;
            sealed.extend_from_slice(&block);
        }
        Ok(sealed)
    }

    /// Reverses [`Self::encrypt_with_public`].
    pub fn decrypt_with_private(&self, key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % key.size() != 0 {
            return Err(NetError::Decode(
                "rsa ciphertext is not a whole number of blocks".into(),
            ));
        }
        let mut opened = Vec::with_capacity(ciphertext.len());
        for block in ciphertext.chunks(key.size()) {
            let chunk = key
                .decrypt(Pkcs1v15Encrypt, block)
                .map_err(|_| NetError::Auth("rsa decryption failed".into()))?;
            opened.extend_from_slice(&chunk);
        }
        Ok(opened)
    }
}

/// Long-term key material and identity of the local node.
#[derive(Clone)]
pub struct LocalIdentity {
    pub device_id: DeviceId,
    pub role: PeerRole,
    pub key_exchange: KeyExchangeKind,
    rsa_private: Option<RsaPrivateKey>,
    ecdh_secret: [u8; 32],
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("device_id", &self.device_id)
            .field("role", &self.role)
            .field("key_exchange", &self.key_exchange)
            .finish()
    }
}

impl LocalIdentity {
    /// Generates long-term keys for the requested exchange kind.
    ///
    /// RSA generation is only performed when the kind requires it.
    pub fn generate(
        device_id: DeviceId,
        role: PeerRole,
        key_exchange: KeyExchangeKind,
    ) -> Result<Self> {
        let rsa_private = match key_exchange {
            KeyExchangeKind::Rsa => Some(
                RsaPrivateKey::new(&mut OsRng, 2048)
                    .map_err(|e| NetError::Config(format!("rsa key generation: {e}")))?,
            ),
            KeyExchangeKind::Ecdh => None,
        };
        let ecdh_secret = StaticSecret::random_from_rng(rand_core::OsRng).to_bytes();
        Ok(Self {
            device_id,
            role,
            key_exchange,
            rsa_private,
            ecdh_secret,
        })
    }

    /// Wire form of the long-term public key, per the exchange kind.
    pub fn public_key_bytes(&self) -> Result<Vec<u8>> {
        match self.key_exchange {
            KeyExchangeKind::Rsa => {
                let key = self.rsa_private()?;
                let der = RsaPublicKey::from(key)
                    .to_pkcs1_der()
                    .map_err(|e| NetError::Config(format!("rsa public encoding: {e}")))?;
                Ok(der.as_bytes().to_vec())
            }
            KeyExchangeKind::Ecdh => {
                let secret = StaticSecret::from(self.ecdh_secret);
                Ok(EcdhPublicKey::from(&secret).as_bytes().to_vec())
            }
        }
    }

    pub fn rsa_private(&self) -> Result<&RsaPrivateKey> {
        self.rsa_private
            .as_ref()
            .ok_or_else(|| NetError::Config("no RSA private key configured".into()))
    }

    pub fn ecdh_secret(&self) -> &[u8; 32] {
        &self.ecdh_secret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aead_roundtrip_and_tamper() {
        let service = CryptoService::new();
        for (cipher, mode) in [
            (CipherKind::Aes, CipherMode::Gcm),
            (CipherKind::Aes, CipherMode::Ccm),
            (CipherKind::Aes, CipherMode::Eax),
            (CipherKind::Twofish, CipherMode::Eax),
            (CipherKind::Twofish, CipherMode::Ccm),
            (CipherKind::Serpent, CipherMode::Eax),
            (CipherKind::Serpent, CipherMode::Ccm),
        ] {
            let data = service.new_symmetric_data(cipher, mode);
            let handler = service
                .bind_symmetric(&data.key, &data.iv, cipher, mode)
                .unwrap();
            let sealed = handler.encrypt(b"synchronize this").unwrap();
            assert_eq!(handler.decrypt(&sealed).unwrap(), b"synchronize this");

            let mut tampered = sealed.clone();
            tampered[0] ^= 0x01;
            assert!(matches!(
                handler.decrypt(&tampered),
                Err(NetError::Auth(_))
            ));
        }
    }

    #[test]
    fn gcm_rejected_for_non_aes() {
        let service = CryptoService::new();
        let data = service.new_symmetric_data(CipherKind::Twofish, CipherMode::Gcm);
        assert!(matches!(
            service.bind_symmetric(&data.key, &data.iv, CipherKind::Twofish, CipherMode::Gcm),
            Err(NetError::Config(_))
        ));
    }

    #[test]
    fn password_derivation_matches_across_peers() {
        let service = CryptoService::new();
        let (initiator, params) = service
            .derive_symmetric_from_password(
                "correct horse battery staple",
                None,
                1_000,
                CipherKind::Aes,
                CipherMode::Gcm,
            )
            .unwrap();
        let (acceptor, _) = service
            .derive_symmetric_from_password(
                "correct horse battery staple",
                Some(params),
                1_000,
                CipherKind::Aes,
                CipherMode::Gcm,
            )
            .unwrap();
        let sealed = initiator.encrypt(b"pairing payload").unwrap();
        assert_eq!(acceptor.decrypt(&sealed).unwrap(), b"pairing payload");
    }

    #[test]
    fn ecdh_derives_shared_handler() {
        let service = CryptoService::new();
        let a = LocalIdentity::generate(
            uuid::Uuid::new_v4(),
            PeerRole::Server,
            KeyExchangeKind::Ecdh,
        )
        .unwrap();
        let b = LocalIdentity::generate(
            uuid::Uuid::new_v4(),
            PeerRole::Server,
            KeyExchangeKind::Ecdh,
        )
        .unwrap();
        let (sender, iv) = service
            .ecdh_derive(a.ecdh_secret(), &b.public_key_bytes().unwrap(), None)
            .unwrap();
        let (receiver, _) = service
            .ecdh_derive(b.ecdh_secret(), &a.public_key_bytes().unwrap(), Some(iv))
            .unwrap();
        let sealed = sender.encrypt(b"kek check").unwrap();
        assert_eq!(receiver.decrypt(&sealed).unwrap(), b"kek check");
    }

    #[test]
    fn rsa_sign_recover_and_encrypt_chunked() {
        let service = CryptoService::new();
        let identity = LocalIdentity::generate(
            uuid::Uuid::new_v4(),
            PeerRole::Server,
            KeyExchangeKind::Rsa,
        )
        .unwrap();
        let public = identity.public_key_bytes().unwrap();

        let signed = service
            .sign_with_private(identity.rsa_private().unwrap(), b"liveness")
            .unwrap();
        let recovered = service
            .verify_and_recover_with_public(&public, &signed)
            .unwrap();
        assert_eq!(recovered, b"liveness");

        // Longer than one modulus block to exercise chunking.
        let plaintext = vec![0x5a_u8; 700];
        let sealed = service.encrypt_with_public(&public, &plaintext).unwrap();
        let opened = service
            .decrypt_with_private(identity.rsa_private().unwrap(), &sealed)
            .unwrap();
        assert_eq!(opened, plaintext);
    }
}
