//! Security module: certificate authority, enrollment and TLS trust.
//!
//! Provides:
//! - Tracker-side CA: root → intermediate hierarchy, CSR validation and signing
//! - Enrollment wire protocol (client and server) over one-way-trusted TLS
//! - Peer identity bootstrap and mutually authenticated rustls configurations

pub mod authority;
pub mod enrollment;
pub mod identity;
