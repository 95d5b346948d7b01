//! Peer identity and TLS trust contexts.
//!
//! Each peer holds an ECDSA key and a certificate issued by the tracker CA:
//! - On first start a key pair and a signing request with a random UUID
//!   subject are generated and submitted to the enrollment endpoint
//! - The returned chain and the private key are persisted together in
//!   `certs/peer-truststore.pem`
//! - Every later connection (peer↔peer, peer↔tracker) is mutually
//!   authenticated with this identity against the bundled root
//!
//! The bundled root (`certs/root-ca.pem`) is verified before anything else:
//! it must be a CA certificate and, when a fingerprint is configured, hash
//! to that fingerprint. A failed check is fatal.

use crate::core::config::CONNECT_RETRY_DELAYS;
use crate::core::connection::pool::WorkerPool;
use crate::core::security::authority::dn_text;
use crate::core::security::enrollment::{EnrollmentError, request_certificate};
use crate::utils::atomic_write::atomic_write;
use anyhow::{Context, Result, anyhow, bail};
use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub const TRUSTSTORE_FILE: &str = "peer-truststore.pem";
pub const ANCHOR_FILE: &str = "root-ca.pem";

/// Mutually authenticated TLS configuration for one identity.
#[derive(Clone)]
pub struct TrustContext {
    /// Accepts only clients presenting a chain to the root.
    pub server: Arc<ServerConfig>,
    /// Presents our chain and verifies servers against the root.
    pub client: Arc<ClientConfig>,
    /// Subject common name of our leaf certificate.
    pub common_name: String,
}

impl std::fmt::Debug for TrustContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustContext")
            .field("common_name", &self.common_name)
            .finish_non_exhaustive()
    }
}

// ── PEM / rustls helpers ─────────────────────────────────────────────────────

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::io::Result<Vec<_>>>()
        .context("invalid certificate PEM")?;
    if certs.is_empty() {
        bail!("no certificate found in PEM");
    }
    Ok(certs)
}

pub fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .context("invalid private key PEM")?
        .ok_or_else(|| anyhow!("no private key found in PEM"))
}

fn root_store(root: &CertificateDer<'static>) -> Result<Arc<RootCertStore>> {
    let mut store = RootCertStore::empty();
    store.add(root.clone())?;
    Ok(Arc::new(store))
}

/// Hex SHA-256 of a certificate's DER encoding.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

/// Check the bundled root anchor and return its DER.
///
/// The anchor must hold exactly one certificate carrying the CA basic
/// constraint. If `expected` is set (hex, `:` separators allowed), the
/// SHA-256 fingerprint must match.
pub fn verify_anchor(root_pem: &str, expected: Option<&str>) -> Result<CertificateDer<'static>> {
    let mut certs = parse_certs(root_pem)?;
    if certs.len() != 1 {
        bail!("trust anchor must contain exactly one certificate");
    }
    let root = certs.remove(0);

    let params = CertificateParams::from_ca_cert_der(&root)
        .map_err(|e| anyhow!("trust anchor is not a parseable certificate: {e}"))?;
    if !matches!(params.is_ca, IsCa::Ca(_)) {
        bail!("trust anchor is not a CA certificate");
    }

    if let Some(expected) = expected {
        let expected: String = expected
            .chars()
            .filter(|c| *c != ':')
            .collect::<String>()
            .to_ascii_lowercase();
        let actual = fingerprint(&root);
        if actual != expected {
            bail!("trust anchor fingerprint mismatch: expected {expected}, found {actual}");
        }
    }
    Ok(root)
}

/// Build mutually authenticated client and server configurations.
pub fn build_trust(key_pem: &str, chain_pem: &str, root_pem: &str) -> Result<TrustContext> {
    let chain = parse_certs(chain_pem)?;
    let root = parse_certs(root_pem)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("empty root PEM"))?;
    let roots = root_store(&root)?;

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::clone(&roots), provider())
        .build()
        .context("building client verifier")?;
    let server = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain.clone(), parse_key(key_pem)?)
        .context("server certificate does not match key")?;

    let client = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain.clone(), parse_key(key_pem)?)
        .context("client certificate does not match key")?;

    let common_name = CertificateParams::from_ca_cert_der(&chain[0])
        .ok()
        .and_then(|p| {
            p.distinguished_name
                .get(&DnType::CommonName)
                .and_then(dn_text)
                .map(str::to_string)
        })
        .unwrap_or_default();

    Ok(TrustContext {
        server: Arc::new(server),
        client: Arc::new(client),
        common_name,
    })
}

/// Server configuration that does not ask for a client certificate. Used
/// by the enrollment endpoint.
pub fn server_only_config(key_pem: &str, chain_pem: &str) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(parse_certs(chain_pem)?, parse_key(key_pem)?)?;
    Ok(Arc::new(config))
}

/// Client configuration that trusts `root` and presents no certificate.
pub fn anchor_client_config(root: &CertificateDer<'static>) -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store(root)?)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Fresh key pair and PEM signing request with a random UUID subject.
/// Blocking: key generation.
pub fn generate_request() -> Result<(String, String)> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, Uuid::new_v4().to_string());
    let csr = params.serialize_request(&key)?.pem()?;
    Ok((key.serialize_pem(), csr))
}

/// What is on disk before enrollment: the verified anchor and, when
/// usable, the stored identity.
struct LocalIdentity {
    root_pem: String,
    root: CertificateDer<'static>,
    stored: Option<TrustContext>,
}

fn load_local(anchor_path: &Path, store_path: &Path, expected: Option<&str>) -> Result<LocalIdentity> {
    let root_pem = std::fs::read_to_string(anchor_path)
        .with_context(|| format!("trust anchor missing at {}", anchor_path.display()))?;
    let root = verify_anchor(&root_pem, expected)?;

    let stored = if store_path.exists() {
        match load_truststore(store_path, &root, &root_pem) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                warn!(event = "identity_invalid", error = %e, "Stored identity unusable, enrolling again");
                None
            }
        }
    } else {
        None
    };
    Ok(LocalIdentity { root_pem, root, stored })
}

fn load_truststore(path: &Path, root: &CertificateDer<'static>, root_pem: &str) -> Result<TrustContext> {
    let pem = std::fs::read_to_string(path)?;
    let chain = parse_certs(&pem)?;
    if chain.last() != Some(root) {
        bail!("stored chain was issued under a different root");
    }
    build_trust(&pem, &pem, root_pem)
}

// ── Identity manager ─────────────────────────────────────────────────────────

pub struct IdentityManager {
    certs_dir: PathBuf,
    anchor_fingerprint: Option<String>,
    pool: WorkerPool,
    retry_delays: Vec<Duration>,
}

impl IdentityManager {
    pub fn new(certs_dir: &Path, anchor_fingerprint: Option<String>, pool: WorkerPool) -> Self {
        Self {
            certs_dir: certs_dir.to_path_buf(),
            anchor_fingerprint,
            pool,
            retry_delays: CONNECT_RETRY_DELAYS.to_vec(),
        }
    }

    /// Override the enrollment backoff schedule.
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    pub fn truststore_path(&self) -> PathBuf {
        self.certs_dir.join(TRUSTSTORE_FILE)
    }

    pub fn anchor_path(&self) -> PathBuf {
        self.certs_dir.join(ANCHOR_FILE)
    }

    /// Return a ready trust context, enrolling with the tracker at
    /// `enroll_addr` if no valid local identity exists.
    ///
    /// Fails without contacting the network when the bundled anchor does
    /// not verify. File access and key generation run on the worker pool.
    pub async fn ensure_identity(&self, enroll_addr: &str) -> Result<TrustContext> {
        let anchor_path = self.anchor_path();
        let store_path = self.truststore_path();
        let expected = self.anchor_fingerprint.clone();
        let local = self
            .pool
            .run(move || load_local(&anchor_path, &store_path, expected.as_deref()))
            .await??;
        if let Some(ctx) = local.stored {
            info!(event = "identity_loaded", cn = %ctx.common_name, "Loaded peer identity");
            return Ok(ctx);
        }
        let LocalIdentity { root, root_pem, .. } = local;

        let (key_pem, csr_pem) = self.pool.run(generate_request).await??;
        let anchor_config = anchor_client_config(&root)?;
        let chain_pem = self.enroll_with_retry(enroll_addr, anchor_config, &csr_pem).await?;

        let chain = parse_certs(&chain_pem)?;
        if chain.last() != Some(&root) {
            bail!("issued chain does not end at the bundled root");
        }

        let store_path = self.truststore_path();
        let ctx = self
            .pool
            .run(move || -> Result<TrustContext> {
                let mut store = key_pem.clone();
                store.push_str(&chain_pem);
                atomic_write(&store_path, store.as_bytes())?;
                build_trust(&key_pem, &chain_pem, &root_pem)
            })
            .await??;
        info!(event = "identity_enrolled", cn = %ctx.common_name, "Enrolled new peer identity");
        Ok(ctx)
    }

    async fn enroll_with_retry(
        &self,
        addr: &str,
        anchor_config: Arc<ClientConfig>,
        csr_pem: &str,
    ) -> Result<String> {
        let mut delays = self.retry_delays.iter();
        loop {
            match request_certificate(addr, Arc::clone(&anchor_config), csr_pem).await {
                Ok(chain) => return Ok(chain),
                Err(e) if e.is_retryable() => {
                    let Some(delay) = delays.next() else {
                        return Err(anyhow!(e).context("enrollment retries exhausted"));
                    };
                    let jitter = Duration::from_millis(rand::random_range(0..250));
                    warn!(
                        event = "enrollment_retry",
                        addr,
                        error = %e,
                        retry_in_ms = (*delay + jitter).as_millis() as u64,
                        "Enrollment endpoint unreachable"
                    );
                    tokio::time::sleep(*delay + jitter).await;
                }
                Err(e @ EnrollmentError::Rejected(_)) => {
                    return Err(anyhow!(e).context("tracker CA rejected the signing request"));
                }
                Err(e) => return Err(anyhow!(e)),
            }
        }
    }
}
