//! Tracker registry: which peer holds which file.
//!
//! Two indexes are kept under one lock and are always mutual inverses:
//! `digest -> holders` and `peer -> files by name`. A digest entry exists
//! iff at least one registered peer lists a file with that digest.

use crate::core::protocol::message::{FileRecord, PeerIdentity};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Indexes {
    holders: HashMap<String, HashSet<PeerIdentity>>,
    files: HashMap<PeerIdentity, BTreeMap<String, FileRecord>>,
    /// Registered peers by identity, keeping the latest announced name.
    peers: HashMap<PeerIdentity, PeerIdentity>,
    last_seen: HashMap<PeerIdentity, Instant>,
}

impl Indexes {
    fn drop_holder(&mut self, digest: &str, peer: &PeerIdentity) {
        if let Some(set) = self.holders.get_mut(digest) {
            set.remove(peer);
            if set.is_empty() {
                self.holders.remove(digest);
            }
        }
    }

    fn insert_file(&mut self, peer: &PeerIdentity, mut file: FileRecord) {
        file.owner = peer.clone();
        file.shared_by_me = false;
        let listing = self.files.entry(peer.clone()).or_default();
        if let Some(old) = listing.insert(file.name.clone(), file.clone())
            && old.digest != file.digest
        {
            let still_listed = listing.values().any(|f| f.digest == old.digest);
            if !still_listed {
                self.drop_holder(&old.digest, peer);
            }
        }
        self.holders.entry(file.digest).or_default().insert(peer.clone());
    }

    fn remove_peer(&mut self, peer: &PeerIdentity) -> bool {
        let known = self.peers.remove(peer).is_some();
        self.last_seen.remove(peer);
        if let Some(listing) = self.files.remove(peer) {
            for file in listing.values() {
                self.drop_holder(&file.digest, peer);
            }
        }
        known
    }

    fn visible_to(&self, requester: &PeerIdentity) -> Vec<FileRecord> {
        self.files
            .iter()
            .filter(|(owner, _)| *owner != requester)
            .flat_map(|(_, listing)| listing.values())
            .filter(|f| f.access.allows(requester))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Indexes>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Indexes> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Upsert `peer` and replace its whole listing. Returns the files now
    /// visible to it.
    pub fn register(&self, peer: &PeerIdentity, files: Vec<FileRecord>) -> Vec<FileRecord> {
        let mut idx = self.lock();
        if let Some(old) = idx.files.remove(peer) {
            for file in old.values() {
                idx.drop_holder(&file.digest, peer);
            }
        }
        idx.files.insert(peer.clone(), BTreeMap::new());
        for file in files {
            idx.insert_file(peer, file);
        }
        idx.peers.insert(peer.clone(), peer.clone());
        idx.last_seen.insert(peer.clone(), Instant::now());
        sorted(idx.visible_to(peer))
    }

    /// Add or replace one file. Registers the peer if it was unknown.
    pub fn share(&self, peer: &PeerIdentity, file: FileRecord) {
        let mut idx = self.lock();
        idx.insert_file(peer, file);
        idx.peers.insert(peer.clone(), peer.clone());
        idx.last_seen.insert(peer.clone(), Instant::now());
    }

    /// Remove one file by name. Returns whether it was listed.
    pub fn unshare(&self, peer: &PeerIdentity, name: &str) -> bool {
        let mut idx = self.lock();
        let Some(removed) = idx.files.get_mut(peer).and_then(|l| l.remove(name)) else {
            return false;
        };
        let still_listed = idx
            .files
            .get(peer)
            .is_some_and(|l| l.values().any(|f| f.digest == removed.digest));
        if !still_listed {
            idx.drop_holder(&removed.digest, peer);
        }
        idx.last_seen.insert(peer.clone(), Instant::now());
        true
    }

    /// Holders of `digest` that `requester` may download from. Never
    /// includes the requester itself. Unknown digest yields an empty list.
    pub fn query(&self, requester: &PeerIdentity, digest: &str) -> Vec<PeerIdentity> {
        let idx = self.lock();
        let Some(holders) = idx.holders.get(digest) else {
            return Vec::new();
        };
        let mut out: Vec<PeerIdentity> = holders
            .iter()
            .filter(|p| *p != requester)
            .filter(|p| {
                idx.files.get(*p).is_some_and(|listing| {
                    listing
                        .values()
                        .any(|f| f.digest == digest && f.access.allows(requester))
                })
            })
            .map(|p| idx.peers.get(p).cloned().unwrap_or_else(|| p.clone()))
            .collect();
        out.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        out
    }

    /// Case-insensitive substring match on file names visible to
    /// `requester`.
    pub fn search(&self, requester: &PeerIdentity, keyword: &str) -> Vec<FileRecord> {
        let needle = keyword.to_lowercase();
        let idx = self.lock();
        sorted(
            idx.visible_to(requester)
                .into_iter()
                .filter(|f| f.name.to_lowercase().contains(&needle))
                .collect(),
        )
    }

    pub fn visible_files(&self, requester: &PeerIdentity) -> Vec<FileRecord> {
        sorted(self.lock().visible_to(requester))
    }

    pub fn known_peers(&self, requester: &PeerIdentity) -> Vec<PeerIdentity> {
        let idx = self.lock();
        let mut out: Vec<_> = idx.peers.values().filter(|p| *p != requester).cloned().collect();
        out.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        out
    }

    /// Every registered peer, for the liveness prober.
    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.lock().peers.values().cloned().collect()
    }

    pub fn contains(&self, peer: &PeerIdentity) -> bool {
        self.lock().peers.contains_key(peer)
    }

    /// Remove a peer and all its records. Returns whether it was known.
    pub fn unregister(&self, peer: &PeerIdentity) -> bool {
        self.lock().remove_peer(peer)
    }

    pub fn touch(&self, peer: &PeerIdentity) {
        let mut idx = self.lock();
        if idx.peers.contains_key(peer) {
            idx.last_seen.insert(peer.clone(), Instant::now());
        }
    }

    /// Evict every peer in `candidates` not seen within `window` of `now`.
    /// The staleness check and removal happen under the same lock, so a
    /// peer that re-registered in between survives.
    pub fn evict_stale(&self, candidates: &[PeerIdentity], window: Duration, now: Instant) -> Vec<PeerIdentity> {
        let mut idx = self.lock();
        let mut evicted = Vec::new();
        for peer in candidates {
            let stale = idx
                .last_seen
                .get(peer)
                .is_some_and(|seen| now.saturating_duration_since(*seen) > window);
            if stale && idx.remove_peer(peer) {
                evicted.push(peer.clone());
            }
        }
        evicted
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let idx = self.lock();
        for (digest, holders) in &idx.holders {
            assert!(!holders.is_empty(), "empty holder set for {digest}");
            for peer in holders {
                assert!(
                    idx.files
                        .get(peer)
                        .is_some_and(|l| l.values().any(|f| &f.digest == digest)),
                    "{peer} indexed for {digest} without a record"
                );
            }
        }
        for (peer, listing) in &idx.files {
            for file in listing.values() {
                assert!(
                    idx.holders.get(&file.digest).is_some_and(|h| h.contains(peer)),
                    "{} from {peer} missing from holders",
                    file.name
                );
            }
        }
    }
}

fn sorted(mut files: Vec<FileRecord>) -> Vec<FileRecord> {
    files.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.owner.port.cmp(&b.owner.port)));
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::message::AccessPolicy;

    fn peer(n: u16) -> PeerIdentity {
        PeerIdentity::new("10.0.0.1", 5000 + n, format!("p{n}"))
    }

    fn file(name: &str, digest: &str) -> FileRecord {
        FileRecord {
            name: name.into(),
            size: 10,
            digest: digest.into(),
            owner: peer(0),
            shared_by_me: true,
            access: AccessPolicy::Public,
        }
    }

    #[test]
    fn test_query_excludes_requester() {
        let reg = Registry::new();
        reg.register(&peer(1), vec![file("a", "D")]);
        reg.register(&peer(2), vec![file("a-copy", "D")]);
        reg.register(&peer(3), vec![]);

        assert_eq!(reg.query(&peer(3), "D"), vec![peer(1), peer(2)]);
        assert_eq!(reg.query(&peer(1), "D"), vec![peer(2)]);
        assert!(reg.query(&peer(1), "unknown").is_empty());
        reg.assert_consistent();
    }

    #[test]
    fn test_register_replaces_listing() {
        let reg = Registry::new();
        reg.register(&peer(1), vec![file("a", "D1"), file("b", "D2")]);
        reg.register(&peer(1), vec![file("c", "D3")]);

        assert!(reg.query(&peer(2), "D1").is_empty());
        assert!(reg.query(&peer(2), "D2").is_empty());
        assert_eq!(reg.query(&peer(2), "D3"), vec![peer(1)]);
        reg.assert_consistent();
    }

    #[test]
    fn test_register_returns_others_files_with_owner_set() {
        let reg = Registry::new();
        reg.register(&peer(1), vec![file("a", "D1")]);
        let visible = reg.register(&peer(2), vec![file("b", "D2")]);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].name, "a");
        assert_eq!(visible[0].owner, peer(1));
        assert!(!visible[0].shared_by_me);
    }

    #[test]
    fn test_share_and_unshare() {
        let reg = Registry::new();
        reg.register(&peer(1), vec![]);
        reg.share(&peer(1), file("a", "D"));
        reg.share(&peer(1), file("a2", "D"));
        assert_eq!(reg.query(&peer(2), "D"), vec![peer(1)]);

        assert!(reg.unshare(&peer(1), "a"));
        assert_eq!(reg.query(&peer(2), "D"), vec![peer(1)]);
        assert!(reg.unshare(&peer(1), "a2"));
        assert!(reg.query(&peer(2), "D").is_empty());
        assert!(!reg.unshare(&peer(1), "a2"));
        reg.assert_consistent();
    }

    #[test]
    fn test_reshare_same_name_new_content_moves_holder() {
        let reg = Registry::new();
        reg.share(&peer(1), file("a", "OLD"));
        reg.share(&peer(1), file("a", "NEW"));
        assert!(reg.query(&peer(2), "OLD").is_empty());
        assert_eq!(reg.query(&peer(2), "NEW"), vec![peer(1)]);
        reg.assert_consistent();
    }

    #[test]
    fn test_restricted_file_only_visible_to_allowed() {
        let reg = Registry::new();
        let friend = PeerIdentity::new("10.0.0.2", 5000, "friend");
        let stranger = PeerIdentity::new("10.0.0.3", 5000, "stranger");
        let mut secret = file("secret.doc", "S");
        secret.access = AccessPolicy::Restricted(vec![friend.clone()]);
        reg.register(&peer(1), vec![secret, file("public.doc", "P")]);

        assert_eq!(reg.query(&friend, "S"), vec![peer(1)]);
        assert!(reg.query(&stranger, "S").is_empty());
        assert_eq!(reg.search(&friend, "DOC").len(), 2);
        assert_eq!(reg.search(&stranger, "doc").len(), 1);
        assert_eq!(reg.visible_files(&stranger).len(), 1);

        // The friend's host is what counts, whichever port it serves on.
        let friend_elsewhere = PeerIdentity::new("10.0.0.2", 7000, "friend");
        assert_eq!(reg.query(&friend_elsewhere, "S"), vec![peer(1)]);
    }

    #[test]
    fn test_search_is_case_insensitive_and_excludes_own() {
        let reg = Registry::new();
        reg.register(&peer(1), vec![file("Holiday.JPG", "H")]);
        reg.register(&peer(2), vec![file("holiday-2.jpg", "H2")]);

        let found = reg.search(&peer(1), "holiday");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "holiday-2.jpg");
        assert!(reg.search(&peer(3), "nothing").is_empty());
    }

    #[test]
    fn test_unregister_removes_everything() {
        let reg = Registry::new();
        reg.register(&peer(1), vec![file("a", "D"), file("b", "E")]);
        reg.register(&peer(2), vec![file("c", "D")]);

        assert!(reg.unregister(&peer(1)));
        assert!(!reg.unregister(&peer(1)));
        assert_eq!(reg.query(&peer(3), "D"), vec![peer(2)]);
        assert!(reg.query(&peer(3), "E").is_empty());
        assert_eq!(reg.known_peers(&peer(3)), vec![peer(2)]);
        reg.assert_consistent();
    }

    #[test]
    fn test_evict_stale_respects_window() {
        let reg = Registry::new();
        reg.register(&peer(1), vec![file("a", "D")]);
        reg.register(&peer(2), vec![file("b", "D")]);
        let candidates = reg.peers();

        let evicted = reg.evict_stale(&candidates, Duration::from_secs(60), Instant::now());
        assert!(evicted.is_empty());

        let later = Instant::now() + Duration::from_secs(120);
        reg.touch(&peer(2));
        let evicted = reg.evict_stale(&[peer(1)], Duration::from_secs(60), later);
        assert_eq!(evicted, vec![peer(1)]);
        assert!(!reg.contains(&peer(1)));
        assert!(reg.contains(&peer(2)));
        reg.assert_consistent();
    }

    #[test]
    fn test_known_peers_keeps_latest_name() {
        let reg = Registry::new();
        reg.register(&peer(1), vec![]);
        let renamed = PeerIdentity::new("10.0.0.1", 5001, "renamed");
        reg.register(&renamed, vec![]);
        let peers = reg.known_peers(&peer(9));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "renamed");
    }
}
