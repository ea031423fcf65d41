use std::net::UdpSocket as StdUdpSocket;
use std::time::Duration;

use race_core::clock::Clock;
use race_core::message::ChannelId;
use race_core::adapter::AdapterWorker;
use race_core::system::{SupervisionPolicy, System};
use race_core::worker::{mailbox, MailboxPolicy, WorkerId, WorkerMsg};
use race_core::WorkerConfig;
use time::macros::datetime;

fn free_port() -> u16 {
    // Bind then drop to learn an OS-assigned ephemeral port, then hand that
    // number to the adapter worker's own config -- a small race (another
    // process could grab it first) acceptable for a local test.
    let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn new_system() -> std::sync::Arc<System> {
    let clock = Clock::new(datetime!(2025-01-01 00:00:00 UTC), 1.0);
    System::new(clock)
}

#[tokio::test]
async fn adapter_handshake_assigns_client_id_and_carries_data() {
    let server_port = free_port();
    let system = new_system();

    let server_config = WorkerConfig::from_json_str(&format!(
        r#"{{"name":"server","class":"adapter","own-ip-address":"127.0.0.1","own-port":{server_port},
            "remote-ip-address":"127.0.0.1","schema":"s1","write-to":"/from-client"}}"#
    ))
    .unwrap();
    let server = AdapterWorker::new(WorkerId::new("server"), &server_config, None, None).unwrap();
    system
        .spawn_worker(
            Box::new(server),
            server_config,
            MailboxPolicy::DropNewest { capacity: 16 },
            SupervisionPolicy::default(),
            None,
        )
        .await
        .unwrap();

    let client_config = WorkerConfig::from_json_str(&format!(
        r#"{{"name":"client","class":"adapter","own-ip-address":"127.0.0.1","own-port":0,
            "remote-ip-address":"127.0.0.1","remote-port":{server_port},"schema":"s1",
            "adapter-role":"client","read-from":"/to-server"}}"#
    ))
    .unwrap();
    let client = AdapterWorker::new(WorkerId::new("client"), &client_config, None, None).unwrap();
    system
        .spawn_worker(
            Box::new(client),
            client_config,
            MailboxPolicy::DropNewest { capacity: 16 },
            SupervisionPolicy::default(),
            None,
        )
        .await
        .unwrap();

    // Let the handshake (Request -> Accept) settle before exercising Data.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let sink_channel: ChannelId = "/from-client".into();
    let (tx, mut rx) = mailbox(MailboxPolicy::DropNewest { capacity: 8 });
    system
        .bus()
        .subscribe(WorkerId::new("sink"), sink_channel, tx);

    let to_server: ChannelId = "/to-server".into();
    system.bus().publish(&to_server, b"hello".to_vec(), None);

    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(WorkerMsg::Bus(m))) => {
            assert_eq!(m.downcast::<Vec<u8>>().unwrap(), b"hello");
        }
        other => panic!("expected the server to forward decoded Data, got {other:?}"),
    }

    system.shutdown().await;
}

#[tokio::test]
async fn schema_mismatch_is_rejected() {
    let server_port = free_port();
    let system = new_system();

    let server_config = WorkerConfig::from_json_str(&format!(
        r#"{{"name":"server","class":"adapter","own-ip-address":"127.0.0.1","own-port":{server_port},
            "remote-ip-address":"127.0.0.1","schema":"expected-schema"}}"#
    ))
    .unwrap();
    let server = AdapterWorker::new(WorkerId::new("server"), &server_config, None, None).unwrap();
    system
        .spawn_worker(
            Box::new(server),
            server_config,
            MailboxPolicy::DropNewest { capacity: 16 },
            SupervisionPolicy::default(),
            None,
        )
        .await
        .unwrap();

    let client_config = WorkerConfig::from_json_str(&format!(
        r#"{{"name":"client","class":"adapter","own-ip-address":"127.0.0.1","own-port":0,
            "remote-ip-address":"127.0.0.1","remote-port":{server_port},"schema":"wrong-schema",
            "adapter-role":"client"}}"#
    ))
    .unwrap();
    let client_id = WorkerId::new("client");
    let client = AdapterWorker::new(client_id.clone(), &client_config, None, None).unwrap();
    system
        .spawn_worker(
            Box::new(client),
            client_config,
            MailboxPolicy::DropNewest { capacity: 16 },
            SupervisionPolicy::default(),
            None,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        system.worker_state(&client_id),
        Some(race_core::LifecycleState::Terminated),
        "a rejected client must request its own termination"
    );

    system.shutdown().await;
}
