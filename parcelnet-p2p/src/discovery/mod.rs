//! Peer discovery sources.
//!
//! This module provides:
//! - The seed list, fetched over HTTP
//! - The persisted state file with bans and bootstrap peers

pub mod persistence;
pub mod seed;

pub use persistence::{load_state, save_state, PersistState};
pub use seed::{parse_seed, Seed};
