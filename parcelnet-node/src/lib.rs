//! Parcelnet node library.
//!
//! This library provides the components for running a standalone gossip
//! node. It is used by the `parcelnet-node` binary and can also be used for
//! testing and embedding.

pub mod cli;
pub mod config;
pub mod node;
pub mod shutdown;
