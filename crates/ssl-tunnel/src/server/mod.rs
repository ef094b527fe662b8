//! TLS-terminating reverse proxy.
//!
//! # Responsibilities
//! - Build the rustls server config from the persisted credential bundle.
//! - Bind the listener and run the accept loop, one task per connection.
//! - Forward every decrypted request to the single backend origin.

pub mod headers;
pub mod listener;
pub mod proxy;
pub mod tls;


pub use listener::serve;
