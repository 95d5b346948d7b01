//! Tracker process core: registry request handling, enrollment endpoint,
//! liveness probing and LAN discovery, composed over one CA.

use crate::core::config::{EVICTION_WINDOW, LIVENESS_INTERVAL, PEER_SERVER_NAME};
use crate::core::connection::client::Connector;
use crate::core::connection::pool::WorkerPool;
use crate::core::connection::reactor::{ConnCtx, Reactor, Reply, RequestHandler};
use crate::core::discovery;
use crate::core::protocol::message::{PeerIdentity, Request, Response};
use crate::core::registry::Registry;
use crate::core::security::authority::CertificateAuthority;
use crate::core::security::enrollment;
use crate::core::security::identity::{build_trust, server_only_config};
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

// ── Request handling ─────────────────────────────────────────────────────────

pub struct TrackerService {
    registry: Arc<Registry>,
}

impl TrackerService {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

/// Peers behind a wildcard bind announce an unroutable host; use the
/// address the connection actually came from.
fn normalize(mut peer: PeerIdentity, remote: SocketAddr) -> PeerIdentity {
    let unroutable = peer.host.is_empty() || peer.host.parse::<IpAddr>().is_ok_and(|ip| ip.is_unspecified());
    if unroutable {
        peer.host = remote.ip().to_string();
    }
    peer
}

impl RequestHandler for TrackerService {
    async fn handle(&self, ctx: &ConnCtx, request: Request) -> Reply {
        let reg = &self.registry;
        let remote = ctx.remote;
        let response = match request {
            Request::Register { peer, files } => {
                let peer = normalize(peer, remote);
                info!(event = "peer_registered", peer = %peer, files = files.len(), "Peer registered");
                Response::Registered {
                    visible: reg.register(&peer, files),
                }
            }
            Request::Share { peer, file } => {
                let peer = normalize(peer, remote);
                debug!(event = "file_shared", peer = %peer, name = %file.name, "File shared");
                reg.share(&peer, file);
                Response::Ack
            }
            Request::Unshare { peer, name } => {
                let peer = normalize(peer, remote);
                if reg.unshare(&peer, &name) {
                    Response::Ack
                } else {
                    Response::NotFound(format!("{name} is not shared by {peer}"))
                }
            }
            Request::Refresh { peer } => {
                let peer = normalize(peer, remote);
                reg.touch(&peer);
                Response::Refreshed {
                    visible: reg.visible_files(&peer),
                }
            }
            Request::Query { requester, digest } => {
                let requester = normalize(requester, remote);
                reg.touch(&requester);
                Response::Holders(reg.query(&requester, &digest))
            }
            Request::Search { requester, keyword } => {
                let requester = normalize(requester, remote);
                reg.touch(&requester);
                Response::SearchResults(reg.search(&requester, &keyword))
            }
            Request::KnownPeers { requester } => {
                let requester = normalize(requester, remote);
                Response::KnownPeers(reg.known_peers(&requester))
            }
            Request::Unregister { peer } => {
                let peer = normalize(peer, remote);
                reg.unregister(&peer);
                info!(event = "peer_unregistered", peer = %peer, "Peer unregistered");
                Response::Ack
            }
            Request::Ping => Response::Pong {
                name: "tracker".into(),
                load: 0,
            },
            other => Response::Error(format!("{} is not served by the tracker", other.kind())),
        };
        response.into()
    }
}

// ── Liveness ─────────────────────────────────────────────────────────────────

/// Pings registered peers and evicts those unreachable and unseen for
/// longer than the eviction window.
pub struct LivenessProbe {
    registry: Arc<Registry>,
    connector: Connector,
    interval: Duration,
    window: Duration,
}

impl LivenessProbe {
    pub fn new(registry: Arc<Registry>, connector: Connector, interval: Duration, window: Duration) -> Self {
        Self {
            registry,
            connector,
            interval,
            window,
        }
    }

    /// One sweep. Returns the evicted peers.
    pub async fn sweep(&self) -> Vec<PeerIdentity> {
        let mut probes = JoinSet::new();
        for peer in self.registry.peers() {
            let connector = self.connector.clone();
            probes.spawn(async move {
                let alive = matches!(
                    connector.request(&peer.addr(), &Request::Ping).await,
                    Ok(Response::Pong { .. })
                );
                (peer, alive)
            });
        }

        let mut unreachable = Vec::new();
        while let Some(joined) = probes.join_next().await {
            let Ok((peer, alive)) = joined else { continue };
            if alive {
                self.registry.touch(&peer);
            } else {
                debug!(event = "peer_unreachable", peer = %peer, "Liveness ping failed");
                unreachable.push(peer);
            }
        }

        let evicted = self.registry.evict_stale(&unreachable, self.window, Instant::now());
        for peer in &evicted {
            warn!(event = "peer_evicted", peer = %peer, "Evicted unreachable peer");
        }
        evicted
    }

    pub async fn run(self, sos: SignalOfStop) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = sos.wait() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }
}

// ── Composition ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub host: String,
    pub port: u16,
    pub enroll_port: u16,
    /// UDP port answering LAN discovery, if enabled.
    pub discovery_port: Option<u16>,
    pub ca_dir: PathBuf,
    pub cert_validity_days: i64,
    pub liveness_interval: Duration,
    pub eviction_window: Duration,
}

impl TrackerConfig {
    pub fn new(host: impl Into<String>, port: u16, enroll_port: u16, ca_dir: PathBuf, cert_validity_days: i64) -> Self {
        Self {
            host: host.into(),
            port,
            enroll_port,
            discovery_port: None,
            ca_dir,
            cert_validity_days,
            liveness_interval: LIVENESS_INTERVAL,
            eviction_window: EVICTION_WINDOW,
        }
    }
}

/// A running tracker.
pub struct Tracker {
    pub registry_addr: SocketAddr,
    pub enroll_addr: SocketAddr,
    pub registry: Arc<Registry>,
    pub ca: Arc<CertificateAuthority>,
    services: JoinSet<()>,
    sos: SignalOfStop,
}

impl Tracker {
    /// Load or create the CA, bind every endpoint and start serving.
    pub async fn start(config: TrackerConfig, pool: WorkerPool, sos: SignalOfStop) -> Result<Self> {
        let dir = config.ca_dir.clone();
        let days = config.cert_validity_days;
        let ca = pool
            .run(move || CertificateAuthority::load_or_create(&dir, days))
            .await??;
        let ca = Arc::new(ca);

        let dir = config.ca_dir.clone();
        let issuer = Arc::clone(&ca);
        let identity = pool
            .run(move || issuer.load_or_issue_tracker_identity(&dir))
            .await??;
        let trust = build_trust(&identity.key_pem, &identity.chain_pem, ca.root_pem())?;
        let enroll_tls = server_only_config(&identity.key_pem, &identity.chain_pem)?;

        let registry = Arc::new(Registry::new());
        let sos = sos.child();
        let mut services = JoinSet::new();

        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("bind tracker on {}:{}", config.host, config.port))?;
        let registry_addr = listener.local_addr()?;
        let reactor = Reactor::new(
            "tracker",
            Arc::clone(&trust.server),
            Arc::new(TrackerService::new(Arc::clone(&registry))),
        );
        services.spawn(reactor.serve(listener, sos.clone()));

        let enroll_listener = TcpListener::bind((config.host.as_str(), config.enroll_port))
            .await
            .with_context(|| format!("bind enrollment on {}:{}", config.host, config.enroll_port))?;
        let enroll_addr = enroll_listener.local_addr()?;
        services.spawn(enrollment::serve(
            enroll_listener,
            TlsAcceptor::from(enroll_tls),
            Arc::clone(&ca),
            pool.clone(),
            sos.clone(),
        ));

        let probe = LivenessProbe::new(
            Arc::clone(&registry),
            Connector::new(Arc::clone(&trust.client), PEER_SERVER_NAME)?,
            config.liveness_interval,
            config.eviction_window,
        );
        services.spawn(probe.run(sos.clone()));

        if let Some(port) = config.discovery_port {
            let socket = UdpSocket::bind((config.host.as_str(), port))
                .await
                .with_context(|| format!("bind discovery on {}:{port}", config.host))?;
            services.spawn(discovery::respond(
                socket,
                registry_addr.port(),
                enroll_addr.port(),
                sos.clone(),
            ));
        }

        info!(
            event = "tracker_started",
            registry = %registry_addr,
            enroll = %enroll_addr,
            "Tracker started"
        );
        Ok(Self {
            registry_addr,
            enroll_addr,
            registry,
            ca,
            services,
            sos,
        })
    }

    /// Block until the stop signal fires and every service has exited.
    pub async fn wait(mut self) {
        self.sos.wait().await;
        while self.services.join_next().await.is_some() {}
        info!(event = "tracker_stopped", "Tracker stopped");
    }

    pub async fn stop(self) {
        self.sos.cancel();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TRACKER_SERVER_NAME;
    use crate::core::protocol::message::{AccessPolicy, FileRecord};
    use crate::core::security::identity::IdentityManager;
    use crate::core::testutil::peer_trust;

    fn ctx() -> ConnCtx {
        ConnCtx {
            id: 1,
            remote: "192.168.1.20:40000".parse().unwrap(),
        }
    }

    fn record(name: &str, digest: &str) -> FileRecord {
        FileRecord {
            name: name.into(),
            size: 3,
            digest: digest.into(),
            owner: PeerIdentity::new("", 0, ""),
            shared_by_me: true,
            access: AccessPolicy::Public,
        }
    }

    #[tokio::test]
    async fn test_register_normalizes_wildcard_host() {
        let registry = Arc::new(Registry::new());
        let svc = TrackerService::new(Arc::clone(&registry));
        let peer = PeerIdentity::new("0.0.0.0", 5000, "alice");
        let reply = svc
            .handle(&ctx(), Request::Register { peer, files: vec![record("a", "D")] })
            .await;
        assert!(matches!(reply.response, Response::Registered { .. }));

        let holders = registry.query(&PeerIdentity::new("10.0.0.9", 1, "x"), "D");
        assert_eq!(holders, vec![PeerIdentity::new("192.168.1.20", 5000, "alice")]);
    }

    #[tokio::test]
    async fn test_unshare_unknown_is_not_found() {
        let svc = TrackerService::new(Arc::new(Registry::new()));
        let reply = svc
            .handle(
                &ctx(),
                Request::Unshare {
                    peer: PeerIdentity::new("10.0.0.1", 5000, "a"),
                    name: "nope".into(),
                },
            )
            .await;
        assert!(matches!(reply.response, Response::NotFound(_)));
    }

    #[tokio::test]
    async fn test_peer_requests_are_refused() {
        let svc = TrackerService::new(Arc::new(Registry::new()));
        let reply = svc.handle(&ctx(), Request::SharedList).await;
        assert!(matches!(reply.response, Response::Error(_)));
    }

    #[tokio::test]
    async fn test_sweep_evicts_unreachable_peers_only_after_window() {
        let ca = CertificateAuthority::generate(365).unwrap();
        let registry = Arc::new(Registry::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let gone = PeerIdentity::new("127.0.0.1", port, "gone");
        registry.register(&gone, vec![record("a", "D")]);

        let connector = Connector::new(peer_trust(&ca).client, PEER_SERVER_NAME).unwrap();
        let patient = LivenessProbe::new(Arc::clone(&registry), connector.clone(), LIVENESS_INTERVAL, Duration::from_secs(60));
        assert!(patient.sweep().await.is_empty());
        assert!(registry.contains(&gone));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let strict = LivenessProbe::new(Arc::clone(&registry), connector, LIVENESS_INTERVAL, Duration::from_millis(10));
        assert_eq!(strict.sweep().await, vec![gone.clone()]);
        assert!(!registry.contains(&gone));
        assert!(registry.query(&PeerIdentity::new("127.0.0.1", 1, "x"), "D").is_empty());
    }

    #[tokio::test]
    async fn test_tracker_enrolls_and_answers_queries() {
        let dir = tempfile::tempdir().unwrap();
        let sos = SignalOfStop::new();
        let pool = WorkerPool::new(4);
        let mut config = TrackerConfig::new("127.0.0.1", 0, 0, dir.path().join("ca"), 365);
        config.discovery_port = None;
        let tracker = Tracker::start(config, pool.clone(), sos.clone()).await.unwrap();

        // A peer receives the root out of band, then enrolls.
        let certs = dir.path().join("certs");
        std::fs::create_dir_all(&certs).unwrap();
        std::fs::write(certs.join("root-ca.pem"), tracker.ca.root_pem()).unwrap();
        let manager = IdentityManager::new(&certs, None, pool.clone());
        let trust = manager
            .ensure_identity(&tracker.enroll_addr.to_string())
            .await
            .unwrap();

        let client = Connector::new(trust.client, TRACKER_SERVER_NAME).unwrap();
        let addr = tracker.registry_addr.to_string();
        let me = PeerIdentity::new("127.0.0.1", 5000, "me");
        let other = PeerIdentity::new("127.0.0.1", 5001, "other");
        client
            .request(&addr, &Request::Register { peer: other, files: vec![record("song.ogg", "S")] })
            .await
            .unwrap();
        let resp = client
            .request(&addr, &Request::Register { peer: me.clone(), files: vec![] })
            .await
            .unwrap();
        match resp {
            Response::Registered { visible } => assert_eq!(visible.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
        let resp = client
            .request(&addr, &Request::Query { requester: me, digest: "S".into() })
            .await
            .unwrap();
        match resp {
            Response::Holders(h) => assert_eq!(h[0].port, 5001),
            other => panic!("unexpected {other:?}"),
        }

        tracker.stop().await;
    }
}
