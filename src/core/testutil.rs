//! Shared fixtures for in-process TLS and transfer tests.

use crate::core::security::authority::CertificateAuthority;
use crate::core::engine::SharedFile;
use crate::core::pipeline::digest::digest_file;
use crate::core::protocol::message::{AccessPolicy, FileRecord, PeerIdentity};
use crate::core::security::identity::{TrustContext, build_trust, generate_request};
use crate::utils::sos::SignalOfStop;
use std::path::Path;

/// Enroll a fresh peer identity directly against `ca`.
pub fn peer_trust(ca: &CertificateAuthority) -> TrustContext {
    let (key_pem, csr_pem) = generate_request().unwrap();
    let chain = ca.sign_request(&csr_pem).unwrap();
    build_trust(&key_pem, &chain, ca.root_pem()).unwrap()
}

/// Write `content` to `dir/name` and describe it as a served file.
pub fn shared_file(dir: &Path, name: &str, content: &[u8], access: AccessPolicy) -> SharedFile {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    let d = digest_file(&path, &SignalOfStop::new(), |_| {}).unwrap().unwrap();
    SharedFile {
        record: FileRecord {
            name: name.into(),
            size: d.size,
            digest: d.digest,
            owner: PeerIdentity::new("127.0.0.1", 5000, "me"),
            shared_by_me: true,
            access,
        },
        path,
        chunk_digests: d.chunk_digests,
    }
}
