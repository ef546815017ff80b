//! Gossip networking for distributed nodes.
//!
//! This crate connects a node to a self-organizing network of peers and
//! moves opaque application payloads ("parcels") between them:
//!
//! - Peer discovery via a seed file, peer shares and a persisted bootstrap list
//! - Three wire protocols (9, 10, 11), negotiated per connection
//! - Connect-And-Trim (CAT): keep dialing, periodically drop random peers
//! - Broadcast with fanout, special (always-kept) peers and bans
//!
//! # Architecture
//!
//! Every peer runs its own read, send and stat tasks. The controller owns the
//! peer store and coordinates everything through channels.
//!
//! ```text
//! Network (to_network / from_network)
//! └── Controller::start()
//!     ├── Accept Task     (listener → handshake → Peer)
//!     ├── Route Task      (to_network → peers)
//!     ├── Data Task       (peers → from_network, pongs, peer shares)
//!     ├── Online Task     (peer status → PeerStore)
//!     ├── Replenish Task  (bootstrap, specials, seed, shares → dial)
//!     ├── Run Task        (CAT rounds, persistence, pings, metrics)
//!     ├── Peer 1 (read/send/stat)
//!     └── Peer 2 (read/send/stat)
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use parcelnet_p2p::{Network, NetworkId, P2pConfig, Parcel, BROADCAST};
//!
//! # async fn example() -> parcelnet_p2p::P2pResult<()> {
//! let config = P2pConfig::new(NetworkId::TEST_NET)
//!     .with_node_name("node-1")
//!     .with_special("10.0.0.1:8108");
//!
//! let network = Network::new(config)?;
//! network.run().await?;
//!
//! network.to_network.send(Parcel::message(BROADCAST, "hello"));
//! while let Some(parcel) = network.from_network.recv().await {
//!     println!("{} sent {} bytes", parcel.address, parcel.payload.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod endpoint;
pub mod error;

pub mod parcel;
pub mod parts;
pub mod protocol;
pub mod resend;

pub mod peer;
pub mod store;
pub mod manager;
pub mod discovery;
pub mod metrics;

mod controller;
pub mod network;

// Re-export main types
pub use config::{NetworkId, P2pConfig, BROADCAST, FULL_BROADCAST, RANDOM_PEER};
pub use controller::MetricsHook;
pub use endpoint::Endpoint;
pub use error::{P2pError, P2pResult};
pub use metrics::MetricsRegistry;
pub use network::{Info, Network, NetworkBuilder};
pub use parcel::{Parcel, ParcelChannel, ParcelType};
pub use peer::{Peer, PeerMetrics};
