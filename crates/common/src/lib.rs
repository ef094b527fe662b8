//! Error taxonomy and wire types shared across `ssl-tunnel` crates.

pub mod error;
pub mod protocol;

pub use error::TunnelError;
