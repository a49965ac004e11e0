use std::time::Duration;

use tokio::time::{sleep, timeout};
use uuid::Uuid;

use syncnet::codec::{Instruction, InstructionResult};
use syncnet::config::NetworkConfig;
use syncnet::coordinator::CoordinatorEvent;
use syncnet::device::{AuthenticationStore, DeviceDirectory};
use syncnet::error::NetError;
use syncnet::messages::{CipherKind, CipherMode, KeyExchangeKind, OpenDataConnectionBody, PeerRole};
use syncnet::store::PendingInitSetup;
use syncnet::testkit::{next_matching, TestNode};
use syncnet::ChannelKind;

const WAIT: Duration = Duration::from_secs(30);

fn quick_config() -> NetworkConfig {
    NetworkConfig {
        pbkdf2_iterations: 1_000,
        ..NetworkConfig::default()
    }
}

fn open_data_body(transient_id: u64) -> OpenDataConnectionBody {
    OpenDataConnectionBody {
        transient_id,
        cek_key: vec![9; 32],
        cek_iv: vec![7; 12],
        cipher: CipherKind::Aes,
        mode: CipherMode::Gcm,
        encrypt: true,
        compress: false,
    }
}

#[tokio::test]
async fn pairing_client_to_server_through_coordinators() {
    let mut server = TestNode::start(quick_config(), PeerRole::Server, KeyExchangeKind::Ecdh)
        .await
        .unwrap();
    let mut client = TestNode::start(quick_config(), PeerRole::Client, KeyExchangeKind::Ecdh)
        .await
        .unwrap();

    let assigned_by_client = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
    let assigned_by_server = Uuid::new_v4();

    let token = server.coordinator.authorize();
    server
        .coordinator
        .request_init_setup(
            PendingInitSetup {
                transient_id: 0x1111_1111,
                shared_password: "correct horse battery staple".into(),
                remote_role: PeerRole::Client,
                owner: Uuid::new_v4(),
                new_device_id: assigned_by_server,
                remote_endpoint: None,
            },
            token,
        )
        .unwrap();

    let token = client.coordinator.authorize();
    client
        .coordinator
        .request_init_setup(
            PendingInitSetup {
                transient_id: 0x1111_1111,
                shared_password: "correct horse battery staple".into(),
                remote_role: PeerRole::Server,
                owner: Uuid::new_v4(),
                new_device_id: assigned_by_client,
                remote_endpoint: Some((
                    server.init_addr.ip().to_string(),
                    server.init_addr.port(),
                )),
            },
            token,
        )
        .unwrap();

    timeout(
        WAIT,
        next_matching(&mut client.events, |event| {
            matches!(event, CoordinatorEvent::PairingCompleted { .. })
        }),
    )
    .await
    .unwrap();
    timeout(
        WAIT,
        next_matching(&mut server.events, |event| {
            matches!(event, CoordinatorEvent::PairingCompleted { .. })
        }),
    )
    .await
    .unwrap();

    // The initiator persisted a freshly generated server password.
    let entry = client.auth.entry(assigned_by_client).await.unwrap();
    assert_eq!(
        entry.plaintext_password.len(),
        quick_config().generated_password_length
    );
    // The acceptor persisted the initiator's public key.
    let learned = server.directory.device(assigned_by_server).await.unwrap();
    assert_eq!(learned.public_key, client.public_key);
}

#[tokio::test]
async fn rsa_command_channel_carries_data_channel_lifecycle() {
    let mut a = TestNode::start(quick_config(), PeerRole::Server, KeyExchangeKind::Rsa)
        .await
        .unwrap();
    let mut b = TestNode::start(quick_config(), PeerRole::Server, KeyExchangeKind::Rsa)
        .await
        .unwrap();
    a.trust(&b, "pairing secret").await.unwrap();
    b.trust(&a, "pairing secret").await.unwrap();

    let token = a.coordinator.authorize();
    let transient_id = a
        .coordinator
        .open_data_channel(b.device_id, true, false, token)
        .await
        .unwrap();

    timeout(
        WAIT,
        next_matching(&mut a.events, |event| {
            matches!(
                event,
                CoordinatorEvent::ChannelEstablished {
                    kind: ChannelKind::Data,
                    ..
                }
            )
        }),
    )
    .await
    .unwrap();
    timeout(
        WAIT,
        next_matching(&mut b.events, |event| {
            matches!(
                event,
                CoordinatorEvent::ChannelEstablished {
                    kind: ChannelKind::Data,
                    ..
                }
            )
        }),
    )
    .await
    .unwrap();

    // Exactly one command channel per peer after the whole exchange.
    assert_eq!(a.coordinator.command_channel_count(), 1);
    assert_eq!(b.coordinator.command_channel_count(), 1);
    assert!(a.coordinator.has_command_channel(b.device_id));
    assert!(a.coordinator.has_data_channel(b.device_id, transient_id));

    a.coordinator
        .send_data(b.device_id, transient_id, b"synchronized chunk")
        .unwrap();
    let event = timeout(
        WAIT,
        next_matching(&mut b.events, |event| {
            matches!(event, CoordinatorEvent::DataReceived { .. })
        }),
    )
    .await
    .unwrap();
    match event {
        CoordinatorEvent::DataReceived {
            device_id, bytes, ..
        } => {
            assert_eq!(device_id, a.device_id);
            assert_eq!(bytes, b"synchronized chunk");
        }
        other => panic!("unexpected event {other:?}"),
    }

    a.coordinator.shutdown().await;
    b.coordinator.shutdown().await;
}

#[tokio::test]
async fn data_channel_enforces_max_size_boundary() {
    let config = NetworkConfig {
        max_data_size: 1_048_576,
        pbkdf2_iterations: 1_000,
        ..NetworkConfig::default()
    };
    let mut a = TestNode::start(config.clone(), PeerRole::Server, KeyExchangeKind::Ecdh)
        .await
        .unwrap();
    let mut b = TestNode::start(config, PeerRole::Server, KeyExchangeKind::Ecdh)
        .await
        .unwrap();
    a.trust(&b, "pairing secret").await.unwrap();
    b.trust(&a, "pairing secret").await.unwrap();

    let token = a.coordinator.authorize();
    // Plaintext channel so the wire frame length equals the payload length.
    let transient_id = a
        .coordinator
        .open_data_channel(b.device_id, false, false, token)
        .await
        .unwrap();
    timeout(
        WAIT,
        next_matching(&mut a.events, |event| {
            matches!(
                event,
                CoordinatorEvent::ChannelEstablished {
                    kind: ChannelKind::Data,
                    ..
                }
            )
        }),
    )
    .await
    .unwrap();

    // Exactly the limit: delivered.
    a.coordinator
        .send_data(b.device_id, transient_id, &vec![0x42_u8; 1_048_576])
        .unwrap();
    let event = timeout(
        WAIT,
        next_matching(&mut b.events, |event| {
            matches!(event, CoordinatorEvent::DataReceived { .. })
        }),
    )
    .await
    .unwrap();
    match event {
        CoordinatorEvent::DataReceived { bytes, .. } => assert_eq!(bytes.len(), 1_048_576),
        other => panic!("unexpected event {other:?}"),
    }

    // One byte past the limit: the channel is torn down.
    a.coordinator
        .send_data(b.device_id, transient_id, &vec![0x42_u8; 1_048_577])
        .unwrap();
    timeout(
        WAIT,
        next_matching(&mut a.events, |event| {
            matches!(
                event,
                CoordinatorEvent::ChannelClosed {
                    kind: ChannelKind::Data,
                    ..
                }
            )
        }),
    )
    .await
    .unwrap();
    assert!(!a.coordinator.has_data_channel(b.device_id, transient_id));
}

#[tokio::test]
async fn inactivity_timer_closes_idle_command_channel() {
    let config = NetworkConfig {
        inactivity_interval: Duration::from_millis(300),
        pbkdf2_iterations: 1_000,
        ..NetworkConfig::default()
    };
    let mut a = TestNode::start(config.clone(), PeerRole::Server, KeyExchangeKind::Ecdh)
        .await
        .unwrap();
    let b = TestNode::start(config, PeerRole::Server, KeyExchangeKind::Ecdh)
        .await
        .unwrap();
    a.trust(&b, "pairing secret").await.unwrap();
    b.trust(&a, "pairing secret").await.unwrap();

    let token = a.coordinator.authorize();
    let receiver = a
        .coordinator
        .send_instruction(
            b.device_id,
            Instruction::OpenDataConnection {
                device_id: b.device_id,
                body: open_data_body(4242),
            },
            token,
        )
        .await
        .unwrap();
    let result = timeout(WAIT, receiver).await.unwrap().unwrap().unwrap();
    assert_eq!(result, InstructionResult::OpenDataConnection { accepted: true });
    assert_eq!(a.coordinator.command_channel_count(), 1);

    // Idle through at least two ticks.
    timeout(
        WAIT,
        next_matching(&mut a.events, |event| {
            matches!(
                event,
                CoordinatorEvent::ChannelClosed {
                    kind: ChannelKind::Command,
                    ..
                }
            )
        }),
    )
    .await
    .unwrap();

    // Closed exactly once, queue drained, registry empty.
    sleep(Duration::from_millis(700)).await;
    let mut extra_closes = 0;
    while let Ok(event) = a.events.try_recv() {
        if matches!(
            event,
            CoordinatorEvent::ChannelClosed {
                kind: ChannelKind::Command,
                ..
            }
        ) {
            extra_closes += 1;
        }
    }
    assert_eq!(extra_closes, 0);
    assert_eq!(a.coordinator.command_channel_count(), 0);
    assert_eq!(a.coordinator.pending_instruction_count(b.device_id), 0);
}

async fn instruct_until_ok(node: &TestNode, peer: syncnet::DeviceId, transient_id: u64) {
    for attempt in 0..5 {
        let token = node.coordinator.authorize();
        let receiver = node
            .coordinator
            .send_instruction(
                peer,
                Instruction::OpenDataConnection {
                    device_id: peer,
                    body: open_data_body(transient_id + attempt),
                },
                token,
            )
            .await
            .unwrap();
        match timeout(Duration::from_secs(10), receiver).await {
            Ok(Ok(Ok(_))) => return,
            _ => sleep(Duration::from_millis(200)).await,
        }
    }
    panic!("command channel never settled");
}

#[tokio::test]
async fn concurrent_opens_leave_one_channel_per_side() {
    let mut config = quick_config();
    config.setup_timeout_command = Duration::from_secs(5);
    let a = TestNode::start(config.clone(), PeerRole::Server, KeyExchangeKind::Ecdh)
        .await
        .unwrap();
    let b = TestNode::start(config, PeerRole::Server, KeyExchangeKind::Ecdh)
        .await
        .unwrap();
    a.trust(&b, "pairing secret").await.unwrap();
    b.trust(&a, "pairing secret").await.unwrap();

    // Race both directions; duplicates are rejected and torn down, so a
    // subsequent instruction settles on exactly one channel per side.
    tokio::join!(
        instruct_until_ok(&a, b.device_id, 1_000),
        instruct_until_ok(&b, a.device_id, 2_000),
    );
    instruct_until_ok(&a, b.device_id, 3_000).await;
    instruct_until_ok(&b, a.device_id, 4_000).await;

    assert_eq!(a.coordinator.command_channel_count(), 1);
    assert_eq!(b.coordinator.command_channel_count(), 1);
}

#[tokio::test]
async fn authorization_tokens_are_single_use() {
    let a = TestNode::start(quick_config(), PeerRole::Server, KeyExchangeKind::Ecdh)
        .await
        .unwrap();
    let token = a.coordinator.authorize();
    a.coordinator
        .send_instruction(
            Uuid::new_v4(),
            Instruction::OpenDataConnection {
                device_id: Uuid::new_v4(),
                body: open_data_body(1),
            },
            token,
        )
        .await
        .unwrap();
    let reuse = a
        .coordinator
        .send_instruction(
            Uuid::new_v4(),
            Instruction::OpenDataConnection {
                device_id: Uuid::new_v4(),
                body: open_data_body(2),
            },
            token,
        )
        .await;
    assert!(matches!(reuse, Err(NetError::LookupMiss(_))));
}

#[tokio::test]
async fn shutdown_completes_pending_instruction_futures() {
    let a = TestNode::start(quick_config(), PeerRole::Server, KeyExchangeKind::Ecdh)
        .await
        .unwrap();
    let b = TestNode::start(quick_config(), PeerRole::Server, KeyExchangeKind::Ecdh)
        .await
        .unwrap();
    a.trust(&b, "pairing secret").await.unwrap();
    // b does not trust a: the acceptor cannot find an authentication entry,
    // so the handshake stalls into failure while the instruction waits.
    let token = a.coordinator.authorize();
    let receiver = a
        .coordinator
        .send_instruction(
            b.device_id,
            Instruction::OpenDataConnection {
                device_id: b.device_id,
                body: open_data_body(77),
            },
            token,
        )
        .await
        .unwrap();
    a.coordinator.shutdown().await;
    let outcome = timeout(WAIT, receiver).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(NetError::ChannelClosed(_))));
}
