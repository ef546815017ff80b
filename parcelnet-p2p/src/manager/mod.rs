//! Connection establishment.
//!
//! [`Dialer`] opens outgoing connections no more often than the redial
//! interval allows, [`LimitedListener`] accepts incoming ones no more often
//! than the listen limit allows.

pub mod dialer;
pub mod listener;

pub use dialer::Dialer;
pub use listener::LimitedListener;
