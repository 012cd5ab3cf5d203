//! End-to-end relay scenarios: a real server on a loopback socket, real
//! clients, and the in-memory directory standing in for the external
//! discovery service.

use std::sync::Arc;
use std::time::Duration;

use trellis_core::keys::Keypair;
use trellis_relay::discovery::{ClientEntry, Directory, MemoryDirectory};
use trellis_relay::{Channel, Client, ClientConfig, Error, Server, ServerConfig};

fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

async fn spawn_server_with(dir: &Arc<MemoryDirectory>, keys: Keypair) -> Arc<Server> {
    let server = Arc::new(
        Server::bind(
            keys,
            "127.0.0.1:0",
            dir.clone() as Arc<dyn Directory>,
            ServerConfig::default(),
        )
        .await
        .expect("server bind"),
    );
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });
    server
}

async fn spawn_server(dir: &Arc<MemoryDirectory>) -> Arc<Server> {
    spawn_server_with(dir, Keypair::generate()).await
}

async fn connected_client_with(
    dir: &Arc<MemoryDirectory>,
    keys: Keypair,
    cfg: ClientConfig,
) -> Arc<Client> {
    let client = Arc::new(Client::new(keys, dir.clone() as Arc<dyn Directory>, cfg));
    client.connect_initial(1).await.expect("connect_initial");
    client
}

async fn connected_client(dir: &Arc<MemoryDirectory>) -> Arc<Client> {
    connected_client_with(dir, Keypair::generate(), ClientConfig::default()).await
}

async fn read_full(channel: &mut Channel, n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    let mut read = 0;
    while read < n {
        let k = channel.read(&mut out[read..]).await.expect("read");
        assert!(k > 0, "unexpected end of stream after {read} of {n} bytes");
        read += k;
    }
    out
}

async fn wait_until(what: &str, mut probe: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !probe() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn basic_dial_and_echo() {
    init_logging();
    let dir = Arc::new(MemoryDirectory::new());
    let server = spawn_server(&dir).await;
    let a = connected_client(&dir).await;
    let b = connected_client(&dir).await;

    let (accepted, dialed) = tokio::join!(a.accept(), b.dial(a.local_pk()));
    let c1 = dialed.expect("dial");
    let mut c2 = accepted.expect("accept");

    assert_eq!(c1.remote_pk(), a.local_pk());
    assert_eq!(c2.remote_pk(), b.local_pk());

    c1.write(b"hello").await.unwrap();
    assert_eq!(read_full(&mut c2, 5).await, b"hello");

    // And the other direction on the same channel.
    c2.write(b"olleh").await.unwrap();
    let mut c1 = c1;
    assert_eq!(read_full(&mut c1, 5).await, b"olleh");

    c1.close().await;
    c2.close().await;
    wait_until("relay pair table to empty", || server.relay_pair_count() == 0).await;

    // Closing again is still success.
    c1.close().await;
    a.close().await;
    a.close().await;
    b.close().await;
    server.close();
    server.close();
}

#[tokio::test]
async fn concurrent_dials_carry_messages_faithfully() {
    init_logging();
    let dir = Arc::new(MemoryDirectory::new());
    let _server = spawn_server(&dir).await;
    let a = connected_client(&dir).await;
    let b = connected_client(&dir).await;

    const CHANNELS: usize = 4;
    const MESSAGES: usize = 100;
    let forward: Vec<u8> = (0..MESSAGES)
        .flat_map(|i| format!("msg {i}").into_bytes())
        .collect();
    let backward: Vec<u8> = (0..MESSAGES)
        .rev()
        .flat_map(|i| format!("msg {i}").into_bytes())
        .collect();

    let mut dialers = Vec::new();
    for _ in 0..CHANNELS {
        let a = a.clone();
        let b_pk = b.local_pk();
        let forward = forward.clone();
        let backward = backward.clone();
        dialers.push(tokio::spawn(async move {
            let mut channel = a.dial(b_pk).await.expect("dial");
            channel.write(&forward).await.expect("write forward");
            let echoed = read_full(&mut channel, backward.len()).await;
            assert_eq!(echoed, backward);
            channel.close().await;
        }));
    }

    let mut acceptors = Vec::new();
    for _ in 0..CHANNELS {
        let mut channel = b.accept().await.expect("accept");
        let forward = forward.clone();
        let backward = backward.clone();
        acceptors.push(tokio::spawn(async move {
            let got = read_full(&mut channel, forward.len()).await;
            assert_eq!(got, forward);
            channel.write(&backward).await.expect("write backward");
            // Wait for the peer's close so our own close is an orderly
            // second half of the exchange.
            let mut buf = [0u8; 1];
            assert_eq!(channel.read(&mut buf).await.expect("trailing read"), 0);
            channel.close().await;
        }));
    }

    for task in dialers.into_iter().chain(acceptors) {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn dialing_an_unlinked_peer_is_rejected() {
    init_logging();
    let dir = Arc::new(MemoryDirectory::new());
    let server = spawn_server(&dir).await;
    let a = connected_client(&dir).await;

    // The ghost has a directory entry delegating our server, but never
    // connects to it.
    let ghost = Keypair::generate();
    dir.set_entry(ClientEntry::new(ghost.public, vec![server.local_pk()]))
        .await
        .unwrap();

    let err = a.dial(ghost.public).await.unwrap_err();
    assert!(matches!(err, Error::Rejected), "got {err:?}");
    assert_eq!(server.relay_pair_count(), 0);
}

#[tokio::test]
async fn dialing_a_peer_with_no_entry_or_servers() {
    init_logging();
    let dir = Arc::new(MemoryDirectory::new());
    let _server = spawn_server(&dir).await;
    let a = connected_client(&dir).await;

    // No directory entry at all.
    let stranger = Keypair::generate();
    assert!(matches!(
        a.dial(stranger.public).await.unwrap_err(),
        Error::Directory(_)
    ));

    // An entry with an empty delegation list.
    let loner = Keypair::generate();
    dir.set_entry(ClientEntry::new(loner.public, vec![]))
        .await
        .unwrap();
    assert!(matches!(
        a.dial(loner.public).await.unwrap_err(),
        Error::NoDelegatedServer
    ));
}

#[tokio::test]
async fn slow_reader_loses_only_its_own_channel() {
    init_logging();
    let dir = Arc::new(MemoryDirectory::new());
    let _server = spawn_server(&dir).await;
    let a = connected_client(&dir).await;
    let b = connected_client(&dir).await;

    let (slow_accepted, slow_dialed) = tokio::join!(b.accept(), a.dial(b.local_pk()));
    let slow_tx = slow_dialed.expect("dial slow");
    let slow_rx = slow_accepted.expect("accept slow"); // never read from

    let (ok_accepted, ok_dialed) = tokio::join!(b.accept(), a.dial(b.local_pk()));
    let ok_tx = ok_dialed.expect("dial ok");
    let mut ok_rx = ok_accepted.expect("accept ok");

    // Push a megabyte and more at a reader that never reads. The receive
    // budget trips, the relay closes that channel with FlowExceeded, and
    // the writer sees it.
    let chunk = vec![0x5a_u8; 32 * 1024];
    let flooding = async {
        for _ in 0..4096 {
            if let Err(e) = slow_tx.write(&chunk).await {
                return e;
            }
        }
        panic!("writer was never told to stop");
    };
    let err = tokio::time::timeout(Duration::from_secs(30), flooding)
        .await
        .expect("flow control verdict");
    assert!(
        matches!(err, Error::FlowExceeded | Error::ChannelClosed),
        "got {err:?}"
    );

    // The sibling channel is untouched in both directions.
    ok_tx.write(b"still alive").await.unwrap();
    assert_eq!(read_full(&mut ok_rx, 11).await, b"still alive");
    ok_rx.write(b"confirmed").await.unwrap();
    let mut ok_tx = ok_tx;
    assert_eq!(read_full(&mut ok_tx, 9).await, b"confirmed");

    drop(slow_rx);
}

#[tokio::test]
async fn server_restart_relinks_and_dials() {
    init_logging();
    let dir = Arc::new(MemoryDirectory::new());
    let server_keys = Keypair::generate();
    let server_secret = server_keys.private_bytes();
    let server = spawn_server_with(&dir, server_keys).await;

    let a = connected_client(&dir).await;
    let b = connected_client(&dir).await;

    let (accepted, dialed) = tokio::join!(b.accept(), a.dial(b.local_pk()));
    let c_a = dialed.expect("dial");
    let mut c_b = accepted.expect("accept");

    server.close();

    // Existing channels fail with LinkClosed once the link dies.
    let mut buf = [0u8; 8];
    assert!(matches!(c_b.read(&mut buf).await, Err(Error::LinkClosed)));
    wait_until("a to drop its dead link", || a.link_count() == 0).await;
    assert!(matches!(c_a.write(b"x").await, Err(Error::LinkClosed)));

    // Same identity, fresh listener; the directory entry is replaced.
    let _server2 = spawn_server_with(&dir, Keypair::from_private(*server_secret)).await;

    wait_until("b to drop its dead link", || b.link_count() == 0).await;
    a.connect_initial(1).await.expect("relink a");
    b.connect_initial(1).await.expect("relink b");

    let (accepted, dialed) = tokio::join!(b.accept(), a.dial(b.local_pk()));
    let c1 = dialed.expect("dial after restart");
    let mut c2 = accepted.expect("accept after restart");
    c1.write(b"back").await.unwrap();
    assert_eq!(read_full(&mut c2, 4).await, b"back");
}

#[tokio::test]
async fn second_link_for_same_key_supersedes_the_first() {
    init_logging();
    let dir = Arc::new(MemoryDirectory::new());
    let server = spawn_server(&dir).await;

    let keys = Keypair::generate();
    let secret = keys.private_bytes();
    let a1 = connected_client_with(&dir, keys, ClientConfig::default()).await;
    let b = connected_client(&dir).await;

    let (accepted, dialed) = tokio::join!(b.accept(), a1.dial(b.local_pk()));
    let mut c_a1 = dialed.expect("dial");
    let _c_b = accepted.expect("accept");

    // The same identity connects again; the server evicts the old link.
    let a2 = connected_client_with(&dir, Keypair::from_private(*secret), ClientConfig::default())
        .await;

    let mut buf = [0u8; 8];
    assert!(matches!(c_a1.read(&mut buf).await, Err(Error::LinkClosed)));
    wait_until("server to hold exactly two links", || {
        server.link_count() == 2
    })
    .await;

    // The new link is the live one.
    let (accepted, dialed) = tokio::join!(b.accept(), a2.dial(b.local_pk()));
    let c1 = dialed.expect("dial over new link");
    let mut c2 = accepted.expect("accept over new link");
    c1.write(b"fresh").await.unwrap();
    assert_eq!(read_full(&mut c2, 5).await, b"fresh");
}

#[tokio::test]
async fn accept_returns_client_closed_after_close() {
    init_logging();
    let dir = Arc::new(MemoryDirectory::new());
    let _server = spawn_server(&dir).await;
    let a = connected_client(&dir).await;

    let waiter = {
        let a = a.clone();
        tokio::spawn(async move { a.accept().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.close().await;

    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("accept should return promptly")
        .unwrap();
    assert!(matches!(result, Err(Error::ClientClosed)));
    assert!(matches!(a.accept().await, Err(Error::ClientClosed)));
    assert!(matches!(
        a.dial(Keypair::generate().public).await,
        Err(Error::ClientClosed)
    ));
}

#[tokio::test]
async fn connect_initial_with_no_servers_fails() {
    init_logging();
    let dir = Arc::new(MemoryDirectory::new());
    let client = Client::new(
        Keypair::generate(),
        dir.clone() as Arc<dyn Directory>,
        ClientConfig::default(),
    );
    assert!(matches!(
        client.connect_initial(1).await.unwrap_err(),
        Error::NoAvailableServers
    ));
}

#[tokio::test]
async fn connect_initial_publishes_delegated_servers() {
    init_logging();
    let dir = Arc::new(MemoryDirectory::new());
    let server = spawn_server(&dir).await;
    let a = connected_client(&dir).await;

    let entry = dir.entry(a.local_pk()).await.unwrap();
    assert_eq!(entry.delegated_servers, vec![server.local_pk()]);

    // Reconnecting bumps the sequence number.
    a.connect_initial(1).await.unwrap();
    let entry2 = dir.entry(a.local_pk()).await.unwrap();
    assert!(entry2.sequence > entry.sequence);
}
