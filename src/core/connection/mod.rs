//! Connection layer.
//!
//! - `reactor`: accept loop and per-connection handshake/request state machine
//! - `client`: outbound mTLS channels with classified failures
//! - `pool`: bounded worker pool for blocking work

pub mod client;
pub mod pool;
pub mod reactor;
