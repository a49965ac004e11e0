use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use uuid::Uuid;

use syncnet::config::NetworkConfig;
use syncnet::connection::Connection;
use syncnet::crypto::{CryptoService, LocalIdentity};
use syncnet::device::{
    AuthenticationStore, DeviceDescriptor, DeviceDirectory, LocalAuthenticationEntry,
    MemoryAuthenticationStore, MemoryDirectory,
};
use syncnet::error::NetError;
use syncnet::handshake::command::CommandHandshake;
use syncnet::handshake::data::DataHandshake;
use syncnet::handshake::init::InitHandshake;
use syncnet::handshake::{HandshakeIo, HandshakeServices, HandshakeState, LocalEndpoints};
use syncnet::messages::{
    encode, CipherKind, CipherMode, CmdRequest, CmdRequestInner, KeyExchangeKind, PeerRole,
    RequestSignature,
};
use syncnet::store::{ConnectionDataStore, PendingDataChannel, PendingInitSetup};

const RUN_LIMIT: Duration = Duration::from_secs(30);

fn quick_config() -> NetworkConfig {
    NetworkConfig {
        pbkdf2_iterations: 1_000,
        ..NetworkConfig::default()
    }
}

struct TestServices {
    crypto: CryptoService,
    local: LocalIdentity,
    directory: Arc<MemoryDirectory>,
    auth: Arc<MemoryAuthenticationStore>,
    store: ConnectionDataStore,
    config: NetworkConfig,
}

impl TestServices {
    fn new(role: PeerRole, key_exchange: KeyExchangeKind) -> Self {
        Self {
            crypto: CryptoService::new(),
            local: LocalIdentity::generate(Uuid::new_v4(), role, key_exchange).unwrap(),
            directory: Arc::new(MemoryDirectory::new()),
            auth: Arc::new(MemoryAuthenticationStore::new()),
            store: ConnectionDataStore::new(),
            config: quick_config(),
        }
    }

    fn descriptor_for(&self, role: PeerRole) -> DeviceDescriptor {
        DeviceDescriptor {
            device_id: self.local.device_id,
            owner: Uuid::new_v4(),
            role,
            command_addr: "127.0.0.1".into(),
            command_port: 9101,
            data_addr: "127.0.0.1".into(),
            data_port: 9102,
            init_addr: "127.0.0.1".into(),
            init_port: 9103,
            public_key: self.local.public_key_bytes().unwrap(),
            key_exchange: self.local.key_exchange,
        }
    }
}

impl HandshakeServices for TestServices {
    fn crypto(&self) -> &CryptoService {
        &self.crypto
    }

    fn local_identity(&self) -> &LocalIdentity {
        &self.local
    }

    fn directory(&self) -> &dyn DeviceDirectory {
        self.directory.as_ref()
    }

    fn authentication(&self) -> &dyn AuthenticationStore {
        self.auth.as_ref()
    }

    fn connection_store(&self) -> &ConnectionDataStore {
        &self.store
    }

    fn network_config(&self) -> &NetworkConfig {
        &self.config
    }

    fn local_endpoints(&self) -> LocalEndpoints {
        LocalEndpoints {
            command: ("127.0.0.1".into(), 9101),
            data: ("127.0.0.1".into(), 9102),
            init: ("127.0.0.1".into(), 9103),
        }
    }
}

async fn io_pair() -> (HandshakeIo, HandshakeIo) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dialer = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let (accepted, _) = listener.accept().await.unwrap();
    let dialed = dialer.await.unwrap();
    let max = NetworkConfig::default().max_data_size;
    let chunk = NetworkConfig::default().read_chunk_size;
    let (a, a_events) = Connection::spawn(dialed, 1, max, chunk).unwrap();
    let (b, b_events) = Connection::spawn(accepted, 2, max, chunk).unwrap();
    (HandshakeIo::new(a, a_events), HandshakeIo::new(b, b_events))
}

#[tokio::test]
async fn pairing_exchanges_identities_and_passwords() {
    let initiator = TestServices::new(PeerRole::Client, KeyExchangeKind::Ecdh);
    let acceptor = TestServices::new(PeerRole::Server, KeyExchangeKind::Ecdh);

    let assigned_to_server = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
    let initiator_pending = PendingInitSetup {
        transient_id: 0x1111_1111,
        shared_password: "correct horse battery staple".into(),
        remote_role: PeerRole::Server,
        owner: Uuid::new_v4(),
        new_device_id: assigned_to_server,
        remote_endpoint: Some(("127.0.0.1".into(), 9103)),
    };
    let assigned_to_client = Uuid::new_v4();
    acceptor.store.add_init(PendingInitSetup {
        transient_id: 0x1111_1111,
        shared_password: "correct horse battery staple".into(),
        remote_role: PeerRole::Client,
        owner: Uuid::new_v4(),
        new_device_id: assigned_to_client,
        remote_endpoint: None,
    });

    let (io_a, io_b) = io_pair().await;
    let local = InitHandshake::new(io_a, &initiator).run_local(initiator_pending);
    let remote = InitHandshake::new(io_b, &acceptor).run_remote();
    let (local, remote) = timeout(RUN_LIMIT, async { tokio::join!(local, remote) })
        .await
        .unwrap();
    let local = local.expect("initiator completes");
    let remote = remote.expect("acceptor completes");
    assert_eq!(local.device_id, assigned_to_server);
    assert_eq!(remote.device_id, assigned_to_client);

    // The initiator generated a password for the server-role peer...
    let entry = initiator.auth.entry(assigned_to_server).await.unwrap();
    assert_eq!(
        entry.plaintext_password.len(),
        quick_config().generated_password_length
    );
    // ...and the acceptor stored the same value for the client.
    let mirrored = acceptor.auth.entry(assigned_to_client).await.unwrap();
    assert_eq!(entry.plaintext_password, mirrored.plaintext_password);

    // The acceptor persisted the initiator's public key and endpoints.
    let learned = acceptor.directory.device(assigned_to_client).await.unwrap();
    assert_eq!(learned.public_key, initiator.local.public_key_bytes().unwrap());
    assert_eq!(learned.role, PeerRole::Client);
    assert_eq!(learned.command_port, 9101);

    // The pending entry was consumed.
    assert!(!acceptor.store.has_init(0x1111_1111));
}

#[tokio::test]
async fn command_handshake_rsa_establishes_shared_cek() {
    let a = TestServices::new(PeerRole::Server, KeyExchangeKind::Rsa);
    let b = TestServices::new(PeerRole::Server, KeyExchangeKind::Rsa);
    a.directory.insert(b.descriptor_for(PeerRole::Server));
    b.directory.insert(a.descriptor_for(PeerRole::Server));
    for (side, peer) in [(&a, &b), (&b, &a)] {
        side.auth
            .put(LocalAuthenticationEntry {
                remote_device_id: peer.local.device_id,
                plaintext_password: "pairing secret".into(),
            })
            .await
            .unwrap();
    }

    let (io_a, io_b) = io_pair().await;
    let descriptor = b.descriptor_for(PeerRole::Server);
    let local = CommandHandshake::new(io_a, &a).run_local(descriptor);
    let remote = CommandHandshake::new(io_b, &b).run_remote();
    let (local, remote) = timeout(RUN_LIMIT, async { tokio::join!(local, remote) })
        .await
        .unwrap();
    let local = local.expect("initiator completes");
    let remote = remote.expect("acceptor completes");
    assert_eq!(local.device_id, b.local.device_id);
    assert_eq!(remote.device_id, a.local.device_id);

    // Both ends hold the same CEK.
    let sealed = local.handler.encrypt(b"post-handshake probe").unwrap();
    assert_eq!(remote.handler.decrypt(&sealed).unwrap(), b"post-handshake probe");
}

#[tokio::test]
async fn command_handshake_ecdh_tampered_iv_fails_auth() {
    let a = TestServices::new(PeerRole::Client, KeyExchangeKind::Ecdh);
    let b = TestServices::new(PeerRole::Server, KeyExchangeKind::Ecdh);
    b.directory.insert(a.descriptor_for(PeerRole::Client));
    b.auth
        .put(LocalAuthenticationEntry {
            remote_device_id: a.local.device_id,
            plaintext_password: "pairing secret".into(),
        })
        .await
        .unwrap();

    let cek = a.crypto.new_symmetric_data(CipherKind::Aes, CipherMode::Gcm);
    let inner = CmdRequestInner {
        cipher: CipherKind::Aes,
        mode: CipherMode::Gcm,
        request_signature: RequestSignature::generate(16).to_bytes().unwrap(),
        cek_key: cek.key,
        cek_iv: cek.iv,
        password_data: None,
    };
    let (kek, mut iv) = a
        .crypto
        .ecdh_derive(
            a.local.ecdh_secret(),
            &b.local.public_key_bytes().unwrap(),
            None,
        )
        .unwrap();
    let data = kek.encrypt(&encode(&inner).unwrap()).unwrap();
    // Single-bit corruption of the cleartext IV.
    iv[0] ^= 0x01;
    let request = CmdRequest {
        peer_id: a.local.device_id,
        data,
        ecdh_iv: Some(iv),
    };

    let (io_a, io_b) = io_pair().await;
    io_a.send(encode(&request).unwrap());
    let failure = timeout(RUN_LIMIT, CommandHandshake::new(io_b, &b).run_remote())
        .await
        .unwrap()
        .expect_err("tampered iv must not authenticate");
    assert!(matches!(failure.error, NetError::Auth(_)));
    assert_eq!(failure.state, HandshakeState::Failed);
}

#[tokio::test]
async fn data_handshake_consumes_pending_entry() {
    let a = TestServices::new(PeerRole::Server, KeyExchangeKind::Ecdh);
    let b = TestServices::new(PeerRole::Server, KeyExchangeKind::Ecdh);

    let cek = a.crypto.new_symmetric_data(CipherKind::Aes, CipherMode::Gcm);
    let initiator_pending = PendingDataChannel {
        transient_id: 7,
        device: b.descriptor_for(PeerRole::Server),
        cek_key: cek.key.clone(),
        cek_iv: cek.iv.clone(),
        cipher: CipherKind::Aes,
        mode: CipherMode::Gcm,
        encrypt: true,
        compress: false,
    };
    b.store.add_data(PendingDataChannel {
        transient_id: 7,
        device: a.descriptor_for(PeerRole::Server),
        cek_key: cek.key,
        cek_iv: cek.iv,
        cipher: CipherKind::Aes,
        mode: CipherMode::Gcm,
        encrypt: true,
        compress: false,
    });

    let (io_a, io_b) = io_pair().await;
    let local = DataHandshake::new(io_a, &a).run_local(initiator_pending);
    let remote = DataHandshake::new(io_b, &b).run_remote();
    let (local, remote) = timeout(RUN_LIMIT, async { tokio::join!(local, remote) })
        .await
        .unwrap();
    let local = local.expect("initiator completes");
    let remote = remote.expect("acceptor completes");
    assert_eq!(local.transient_id, Some(7));
    assert_eq!(remote.device_id, a.local.device_id);
    assert!(!b.store.has_data(a.local.device_id, 7));

    let sealed = remote.handler.encrypt(b"bulk bytes").unwrap();
    assert_eq!(local.handler.decrypt(&sealed).unwrap(), b"bulk bytes");
}

#[tokio::test]
async fn command_handshake_fails_when_peer_vanishes() {
    let a = TestServices::new(PeerRole::Client, KeyExchangeKind::Ecdh);
    let b = TestServices::new(PeerRole::Server, KeyExchangeKind::Ecdh);
    a.directory.insert(b.descriptor_for(PeerRole::Server));
    a.auth
        .put(LocalAuthenticationEntry {
            remote_device_id: b.local.device_id,
            plaintext_password: "pairing secret".into(),
        })
        .await
        .unwrap();

    let (io_a, io_b) = io_pair().await;
    drop(io_b);
    let failure = timeout(
        RUN_LIMIT,
        CommandHandshake::new(io_a, &a).run_local(b.descriptor_for(PeerRole::Server)),
    )
    .await
    .unwrap()
    .expect_err("no acceptor means no channel");
    assert!(matches!(failure.error, NetError::ChannelClosed(_)));
    assert_eq!(failure.state, HandshakeState::Failed);
}
