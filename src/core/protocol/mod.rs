//! Request/response protocol spoken between peers and the tracker.
//!
//! - `message`: identities, file records and the request/response enums
//! - `codec`: length-prefixed bincode framing with size and time bounds

pub mod codec;
pub mod message;
