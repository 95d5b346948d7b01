//! Wire vocabulary shared by tracker and peers.
//!
//! Each connection carries a sequence of `Request` → `Response` exchanges.
//! Tracker-directed requests (`Register`, `Query`, ...) and peer-directed
//! requests (`GetChunk`, `FileInfo`, ...) share one enum so the reactor can
//! demultiplex them with a single codec; a handler answers requests it does
//! not serve with `Response::Error`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

// ── Peer identity ────────────────────────────────────────────────────────────

/// Network identity of a peer as advertised to the tracker.
///
/// Equality and hashing use `(host, port)` only. The display name and the
/// load snapshot never affect identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub host: String,
    pub port: u16,
    pub name: String,
    /// Chunk requests the peer was serving when this snapshot was taken.
    #[serde(default)]
    pub load: u32,
}

impl PeerIdentity {
    pub fn new(host: impl Into<String>, port: u16, name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            name: name.into(),
            load: 0,
        }
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.name)
    }
}

// ── Files ────────────────────────────────────────────────────────────────────

/// Who may discover and download a shared file.
///
/// Access is granted per host. A serving peer only learns the source IP of
/// an incoming connection, so the port of an allow-list entry identifies
/// the peer for display and does not take part in the match. The tracker
/// and the serving peer apply the same rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AccessPolicy {
    #[default]
    Public,
    /// Only the listed peers (matched by host) see the file.
    Restricted(Vec<PeerIdentity>),
}

impl AccessPolicy {
    pub fn allows(&self, peer: &PeerIdentity) -> bool {
        self.allows_host(&peer.host)
    }

    /// Check a connection's source address.
    pub fn allows_addr(&self, ip: IpAddr) -> bool {
        self.allows_host(&ip.to_string())
    }

    pub fn allows_host(&self, host: &str) -> bool {
        match self {
            AccessPolicy::Public => true,
            AccessPolicy::Restricted(allowed) => allowed.iter().any(|p| same_host(&p.host, host)),
        }
    }
}

/// IP literals compare as addresses (so `::ffff:10.0.0.1` is `10.0.0.1`),
/// names case-insensitively.
fn same_host(a: &str, b: &str) -> bool {
    match (a.parse::<IpAddr>(), b.parse::<IpAddr>()) {
        (Ok(x), Ok(y)) => x.to_canonical() == y.to_canonical(),
        _ => a.eq_ignore_ascii_case(b),
    }
}

/// A shareable file instance. `(name, owner)` is unique; the same digest
/// may be hosted by many owners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    /// Hex SHA3-256 of the whole content.
    pub digest: String,
    pub owner: PeerIdentity,
    /// Set locally when the receiving node is the owner.
    #[serde(default)]
    pub shared_by_me: bool,
    #[serde(default)]
    pub access: AccessPolicy,
}

/// Everything a downloader needs to schedule and verify chunk fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileManifest {
    pub name: String,
    pub size: u64,
    pub digest: String,
    pub chunk_count: u32,
    pub chunk_digests: Vec<String>,
    /// Serving load of the answering peer.
    pub load: u32,
}

// ── Requests / responses ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Announce address and full listing; replaces any previous listing.
    Register {
        peer: PeerIdentity,
        files: Vec<FileRecord>,
    },
    /// Add one file to an existing listing.
    Share { peer: PeerIdentity, file: FileRecord },
    /// Remove one file by name.
    Unshare { peer: PeerIdentity, name: String },
    /// Re-fetch the visible listing.
    Refresh { peer: PeerIdentity },
    /// Holders of a content digest, excluding the requester.
    Query {
        requester: PeerIdentity,
        digest: String,
    },
    /// Case-insensitive name search over files visible to the requester.
    Search {
        requester: PeerIdentity,
        keyword: String,
    },
    KnownPeers { requester: PeerIdentity },
    Unregister { peer: PeerIdentity },

    GetChunk { digest: String, index: u32 },
    FileInfo { digest: String },
    SharedList,
    Ping,
}

impl Request {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Register { .. } => "REGISTER",
            Request::Share { .. } => "SHARE",
            Request::Unshare { .. } => "UNSHARE",
            Request::Refresh { .. } => "REFRESH",
            Request::Query { .. } => "QUERY",
            Request::Search { .. } => "SEARCH",
            Request::KnownPeers { .. } => "GET_KNOWN_PEERS",
            Request::Unregister { .. } => "UNREGISTER",
            Request::GetChunk { .. } => "GET_CHUNK",
            Request::FileInfo { .. } => "FILE_INFO",
            Request::SharedList => "SHARED_LIST",
            Request::Ping => "PING",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Registered { visible: Vec<FileRecord> },
    Refreshed { visible: Vec<FileRecord> },
    Ack,
    Holders(Vec<PeerIdentity>),
    SearchResults(Vec<FileRecord>),
    KnownPeers(Vec<PeerIdentity>),

    Chunk {
        digest: String,
        index: u32,
        checksum: String,
        data: Vec<u8>,
    },
    FileInfo(FileManifest),
    SharedList(Vec<FileRecord>),
    Pong { name: String, load: u32 },

    /// Serving peer at its concurrency cap. Not an error; try elsewhere.
    Busy,
    NotFound(String),
    Error(String),
}

impl Response {
    /// Short label for logs, without payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Registered { .. } => "REGISTERED",
            Response::Refreshed { .. } => "REFRESHED",
            Response::Ack => "ACK",
            Response::Holders(_) => "HOLDERS",
            Response::SearchResults(_) => "SEARCH_RESULTS",
            Response::KnownPeers(_) => "KNOWN_PEERS",
            Response::Chunk { .. } => "CHUNK",
            Response::FileInfo(_) => "FILE_INFO",
            Response::SharedList(_) => "SHARED_LIST",
            Response::Pong { .. } => "PONG",
            Response::Busy => "BUSY",
            Response::NotFound(_) => "NOT_FOUND",
            Response::Error(_) => "ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_ignores_name_and_load() {
        let a = PeerIdentity::new("10.0.0.1", 5000, "alice");
        let mut b = PeerIdentity::new("10.0.0.1", 5000, "renamed");
        b.load = 3;
        assert_eq!(a, b);

        let set: HashSet<_> = [a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_ne!(a, PeerIdentity::new("10.0.0.1", 5001, "alice"));
    }

    #[test]
    fn test_identity_display_and_addr() {
        let p = PeerIdentity::new("10.0.0.1", 5000, "alice");
        assert_eq!(p.to_string(), "10.0.0.1:5000:alice");
        assert_eq!(p.addr(), "10.0.0.1:5000");
        assert_eq!(PeerIdentity::new("::1", 5000, "v6").addr(), "[::1]:5000");
    }

    #[test]
    fn test_access_policy() {
        let alice = PeerIdentity::new("10.0.0.1", 5000, "alice");
        let bob = PeerIdentity::new("10.0.0.2", 5000, "bob");
        let policy = AccessPolicy::Restricted(vec![alice.clone()]);
        assert!(policy.allows(&alice));
        assert!(!policy.allows(&bob));
        assert!(AccessPolicy::Public.allows(&bob));
    }

    #[test]
    fn test_access_policy_matches_by_host() {
        let policy = AccessPolicy::Restricted(vec![PeerIdentity::new("10.0.0.1", 5000, "alice")]);
        // Same host on another port: the serving peer cannot tell them apart.
        assert!(policy.allows(&PeerIdentity::new("10.0.0.1", 6000, "alice-again")));
        assert!(policy.allows_addr("10.0.0.1".parse().unwrap()));
        assert!(policy.allows_addr("::ffff:10.0.0.1".parse().unwrap()));
        assert!(!policy.allows_addr("10.0.0.2".parse().unwrap()));

        let named = AccessPolicy::Restricted(vec![PeerIdentity::new("Laptop.lan", 5000, "")]);
        assert!(named.allows_host("laptop.lan"));
        assert!(!named.allows_addr("10.0.0.1".parse().unwrap()));
        assert!(AccessPolicy::Public.allows_addr("10.0.0.9".parse().unwrap()));
    }
}
