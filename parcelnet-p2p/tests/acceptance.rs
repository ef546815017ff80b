//! Acceptance tests for the P2P layer.
//!
//! These tests run real networks on localhost and verify:
//! 1. Version negotiation - every pair of protocol ranges connects on the
//!    highest common version, or not at all
//! 2. Message exchange - parcels arrive stamped with the sender's hash and
//!    can be answered through that hash
//! 3. Broadcast - fanout limits a broadcast, full broadcast reaches everyone
//! 4. Loopback - a node never connects to itself
//! 5. Bans - banning a peer disconnects everything on its ip
//! 6. Rejection - a full node refuses with alternatives that get dialed

use std::time::Duration;

use tokio::time::{sleep, timeout};

use parcelnet_p2p::{Network, NetworkId, P2pConfig, Parcel, BROADCAST, FULL_BROADCAST};

/// Timeout for waiting on connections and parcels.
const WAIT: Duration = Duration::from_secs(10);

/// Create a test node configuration with port 0 (OS assigns port).
fn test_config(name: &str) -> P2pConfig {
    let mut config = P2pConfig::new(NetworkId::LOCAL_NET)
        .with_node_name(name)
        .with_bind_ip("127.0.0.1")
        .with_listen_port("0");
    // every node shares 127.0.0.1
    config.listen_limit = Duration::ZERO;
    config.dial_timeout = Duration::from_secs(2);
    config.handshake_timeout = Duration::from_secs(2);
    config
}

fn address(network: &Network) -> String {
    let addr = network.local_addr().expect("network is running");
    format!("127.0.0.1:{}", addr.port())
}

async fn start(config: P2pConfig) -> Network {
    let network = Network::new(config).expect("valid config");
    network.run().await.expect("network starts");
    network
}

/// Start a node that keeps connecting to `hub`.
async fn start_leaf(name: &str, hub: &Network, configure: impl FnOnce(P2pConfig) -> P2pConfig) -> Network {
    start(configure(test_config(name).with_special(address(hub)))).await
}

/// Poll `condition` until it holds or the wait times out.
async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    condition()
}

async fn receive(network: &Network) -> Option<Parcel> {
    timeout(WAIT, network.from_network.recv()).await.ok().flatten()
}

#[tokio::test]
async fn test_version_negotiation_matrix() {
    let cases = [
        ((9, 9), (9, 11), Some(9)),
        ((9, 10), (9, 11), Some(10)),
        ((9, 11), (9, 11), Some(11)),
        ((10, 11), (9, 10), Some(10)),
        ((9, 11), (9, 9), Some(9)),
        ((11, 11), (9, 10), None),
    ];

    for (i, ((hub_min, hub_max), (leaf_min, leaf_max), expected)) in cases.into_iter().enumerate() {
        let hub = start(test_config(&format!("hub-{i}")).with_protocol(hub_min, hub_max)).await;
        let leaf = start_leaf(&format!("leaf-{i}"), &hub, |c| c.with_protocol(leaf_min, leaf_max)).await;

        match expected {
            Some(version) => {
                assert!(
                    wait_for(|| hub.total() == 1 && leaf.total() == 1).await,
                    "case {i}: no connection"
                );
                for metrics in hub.get_peer_metrics().values().chain(leaf.get_peer_metrics().values()) {
                    assert_eq!(metrics.protocol_version, version, "case {i}");
                }

                leaf.to_network.send(Parcel::message(BROADCAST, format!("hello {i}")));
                let parcel = receive(&hub).await.expect("parcel arrives");
                assert_eq!(&parcel.payload[..], format!("hello {i}").as_bytes(), "case {i}");
            }
            None => {
                sleep(Duration::from_secs(2)).await;
                assert_eq!(hub.total(), 0, "case {i}");
                assert_eq!(leaf.total(), 0, "case {i}");
            }
        }

        hub.stop().unwrap();
        leaf.stop().unwrap();
    }
}

#[tokio::test]
async fn test_message_exchange() {
    let hub = start(test_config("hub")).await;
    let leaf = start_leaf("leaf", &hub, |c| c).await;
    assert!(wait_for(|| hub.total() == 1 && leaf.total() == 1).await);

    let leaf_hash = hub.get_peer_metrics().into_keys().next().unwrap();
    let hub_hash = leaf.get_peer_metrics().into_keys().next().unwrap();

    leaf.to_network.send(Parcel::message(hub_hash.clone(), "ping from leaf"));
    let parcel = receive(&hub).await.expect("parcel arrives at hub");
    assert_eq!(parcel.address, leaf_hash);
    assert_eq!(&parcel.payload[..], b"ping from leaf");

    // answer through the stamped address
    hub.to_network.send(Parcel::message(parcel.address, "pong from hub"));
    let answer = receive(&leaf).await.expect("answer arrives at leaf");
    assert_eq!(answer.address, hub_hash);
    assert_eq!(&answer.payload[..], b"pong from hub");

    let info = hub.get_info();
    assert_eq!(info.peers, 1);

    hub.stop().unwrap();
    leaf.stop().unwrap();
}

#[tokio::test]
async fn test_broadcast_fanout() {
    let hub = start(test_config("hub").with_fanout(2)).await;
    let mut leaves = Vec::new();
    for i in 0..4 {
        leaves.push(start_leaf(&format!("leaf-{i}"), &hub, |c| c).await);
    }
    assert!(wait_for(|| hub.total() == 4).await);

    hub.to_network.send(Parcel::message(BROADCAST, "fanout"));
    sleep(Duration::from_secs(1)).await;
    let reached = leaves.iter().filter(|l| l.from_network.try_recv().is_some()).count();
    assert_eq!(reached, 2);

    hub.to_network.send(Parcel::message(FULL_BROADCAST, "everyone"));
    for leaf in &leaves {
        let parcel = receive(leaf).await.expect("full broadcast arrives");
        assert_eq!(&parcel.payload[..], b"everyone");
    }

    hub.stop().unwrap();
    for leaf in &leaves {
        leaf.stop().unwrap();
    }
}

#[tokio::test]
async fn test_loopback_never_connects() {
    let node = start(test_config("lonely")).await;
    node.set_special(address(&node));

    sleep(Duration::from_secs(3)).await;
    assert_eq!(node.total(), 0);

    node.stop().unwrap();
}

#[tokio::test]
async fn test_ban_disconnects_ip() {
    let hub = start(test_config("hub")).await;
    let a = start_leaf("leaf-a", &hub, |c| c).await;
    let b = start_leaf("leaf-b", &hub, |c| c).await;
    assert!(wait_for(|| hub.total() == 2).await);

    // both leaves share 127.0.0.1
    let hash = hub.get_peer_metrics().into_keys().next().unwrap();
    hub.ban(hash);

    assert!(wait_for(|| hub.total() == 0).await);

    // newcomers from the banned ip are refused
    let c = start_leaf("leaf-c", &hub, |c| c).await;
    sleep(Duration::from_secs(2)).await;
    assert_eq!(hub.total(), 0);
    assert_eq!(c.total(), 0);

    hub.stop().unwrap();
    a.stop().unwrap();
    b.stop().unwrap();
    c.stop().unwrap();
}

#[tokio::test]
async fn test_reject_offers_alternatives() {
    let mut full = test_config("full");
    full.max_incoming = 1;
    let hub = start(full).await;

    let first = start_leaf("first", &hub, |c| c).await;
    assert!(wait_for(|| hub.total() == 1 && first.total() == 1).await);

    // the hub refuses and points at `first`, which accepts
    let second = start_leaf("second", &hub, |c| c).await;
    assert!(wait_for(|| second.total() == 1 && first.total() == 2).await);
    assert_eq!(hub.total(), 1);

    let metrics = second.get_peer_metrics();
    let peer = metrics.values().next().unwrap();
    assert_eq!(peer.peer_address, "127.0.0.1");
    assert!(!peer.incoming);

    hub.stop().unwrap();
    first.stop().unwrap();
    second.stop().unwrap();
}

#[tokio::test]
async fn test_metrics_hook() {
    let hub = start(test_config("hub")).await;
    let leaf = start_leaf("leaf", &hub, |c| c).await;
    assert!(wait_for(|| hub.total() == 1).await);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    hub.set_metrics_hook(move |metrics| {
        let _ = tx.send(metrics.len());
    });

    let seen = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(seen, 1);

    hub.stop().unwrap();
    leaf.stop().unwrap();
}
