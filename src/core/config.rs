//! Centralized configuration constants for p2pshare.
//!
//! All tunable defaults live here so they can be reviewed and adjusted
//! in a single place. Values that operators may change at runtime are
//! mirrored in [`crate::workers::settings::Settings`], which falls back
//! to these constants.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Fixed chunk size in bytes (2 MiB). Chunk `i` covers
/// `[i * CHUNK_SIZE, min((i + 1) * CHUNK_SIZE, size))`.
pub const CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Read buffer used when streaming a file through the digest engine.
pub const HASH_READ_BUFFER: usize = 256 * 1024;

/// Maximum chunk fetches in flight for a single download.
pub const MAX_PARALLEL_CHUNKS: usize = 4;

/// Attempts per chunk before the whole download is marked failed.
/// Each retry goes to a different source when one is available.
pub const MAX_CHUNK_RETRIES: u32 = 3;

/// Pause before re-queueing a chunk whose sources all answered Busy.
pub const BUSY_BACKOFF: Duration = Duration::from_millis(500);

/// Delay between `cancel_task` and the physical removal of `.part`/`.meta`
/// files. In-flight chunk writes land inside this window.
pub const CANCEL_GRACE: Duration = Duration::from_secs(3);

// ── Service capacity ─────────────────────────────────────────────────────────

/// Default cap on chunk requests a peer serves concurrently (K).
/// A request arriving at the cap is answered with `Busy`.
pub const DEFAULT_SERVICE_CAP: u32 = 3;

// ── Task monitor ─────────────────────────────────────────────────────────────

/// Cadence of the stall monitor scan.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Default task stall threshold. A `Downloading`/`Sharing` task with no
/// activity for longer than this flips to `Timeout`.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(60);

// ── Connection / Network ─────────────────────────────────────────────────────

/// Default tracker request port (mutually authenticated TLS).
pub const TRACKER_PORT: u16 = 6001;

/// Default tracker enrollment port (server-authenticated TLS only).
pub const ENROLL_PORT: u16 = 9091;

/// Default peer chunk-service port.
pub const PEER_PORT: u16 = 5000;

/// UDP port the tracker listens on for LAN discovery broadcasts.
pub const DISCOVERY_PORT: u16 = 6002;

/// TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS handshake timeout, independent of the connect and I/O timeouts.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-socket read/write timeout for a single frame.
pub const IO_TIMEOUT: Duration = Duration::from_secs(15);

/// Idle time after which the reactor closes an established connection.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum accepted frame payload. A 2 MiB chunk plus its envelope fits.
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Maximum size of an enrollment request or response body.
pub const MAX_ENROLL_MESSAGE: usize = 64 * 1024;

/// How long a LAN discovery probe waits for a tracker answer.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Backoff between enrollment / registration attempts when the tracker
/// is unreachable.
pub const CONNECT_RETRY_DELAYS: &[Duration] = &[
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
];

// ── Reactor / worker pool ────────────────────────────────────────────────────

/// Event-loop threads driving socket readiness.
pub const REACTOR_THREADS: usize = 2;

/// Upper bound on concurrently running blocking jobs (disk, hashing,
/// signing, key generation).
pub const WORKER_POOL_SIZE: usize = 8;

// ── Tracker liveness ─────────────────────────────────────────────────────────

/// How often the tracker pings registered peers.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(30);

/// A peer neither seen nor answering for this long is evicted.
pub const EVICTION_WINDOW: Duration = Duration::from_secs(120);

// ── Certificates ─────────────────────────────────────────────────────────────

/// Validity window of peer certificates issued by the tracker CA.
pub const CERT_VALIDITY_DAYS: i64 = 365;

/// Validity window of the root and intermediate authorities.
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// Server name every peer certificate carries as a SAN. Peers are
/// addressed by IP, so clients verify against this fixed name.
pub const PEER_SERVER_NAME: &str = "peer.p2p.local";

/// Server name carried by the tracker's service certificate.
pub const TRACKER_SERVER_NAME: &str = "tracker.p2p.local";
