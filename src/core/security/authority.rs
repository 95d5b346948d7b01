//! Tracker-side certificate authority.
//!
//! Trust hierarchy:
//! - Root: self-signed, generated once. Only its certificate is kept; the
//!   root key is discarded after signing the intermediate.
//! - Intermediate: signs every peer certificate and the tracker's own
//!   service certificate. Key and certificate live in the `ca/` keystore.
//! - Leaf: one per enrolled peer (SAN `peer.p2p.local`) plus the tracker
//!   service identity (SAN `tracker.p2p.local`).
//!
//! Keystore layout under `ca/`:
//! - `root-ca.pem`
//! - `intermediate-ca.pem`, `intermediate-key.pem`
//! - `tracker-key.pem`, `tracker-chain.pem`

use crate::core::config::{CA_VALIDITY_DAYS, PEER_SERVER_NAME, TRACKER_SERVER_NAME};
use crate::utils::atomic_write::atomic_write;
use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use std::path::Path;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

const ROOT_FILE: &str = "root-ca.pem";
const INTERMEDIATE_FILE: &str = "intermediate-ca.pem";
const INTERMEDIATE_KEY_FILE: &str = "intermediate-key.pem";
const TRACKER_KEY_FILE: &str = "tracker-key.pem";
const TRACKER_CHAIN_FILE: &str = "tracker-chain.pem";

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("malformed signing request: {0}")]
    Malformed(String),
    #[error("signing request has no subject common name")]
    MissingSubject,
    #[error("signing failed: {0}")]
    Signing(#[from] rcgen::Error),
}

/// Key material for a TLS endpoint, PEM encoded.
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    pub key_pem: String,
    /// Leaf, intermediate, root.
    pub chain_pem: String,
}

pub struct CertificateAuthority {
    root_pem: String,
    intermediate: Certificate,
    intermediate_pem: String,
    intermediate_key: KeyPair,
    leaf_validity: time::Duration,
}

impl CertificateAuthority {
    /// Load the keystore from `dir`, creating a fresh hierarchy when it is
    /// missing. Blocking: key generation and file I/O.
    pub fn load_or_create(dir: &Path, leaf_validity_days: i64) -> Result<Self> {
        let root_path = dir.join(ROOT_FILE);
        let inter_path = dir.join(INTERMEDIATE_FILE);
        let key_path = dir.join(INTERMEDIATE_KEY_FILE);

        if root_path.exists() && inter_path.exists() && key_path.exists() {
            let root_pem = std::fs::read_to_string(&root_path)?;
            let intermediate_pem = std::fs::read_to_string(&inter_path)?;
            let key_pem = std::fs::read_to_string(&key_path)?;

            let intermediate_key =
                KeyPair::from_pem(&key_pem).context("intermediate key is unreadable")?;
            // Re-materialize an issuer handle with the stored subject and
            // key; the distributed certificate stays the stored PEM.
            let intermediate = CertificateParams::from_ca_cert_pem(&intermediate_pem)
                .context("intermediate certificate is unreadable")?
                .self_signed(&intermediate_key)?;

            info!(event = "ca_loaded", dir = %dir.display(), "Loaded CA keystore");
            return Ok(Self {
                root_pem,
                intermediate,
                intermediate_pem,
                intermediate_key,
                leaf_validity: time::Duration::days(leaf_validity_days),
            });
        }

        let ca = Self::generate(leaf_validity_days)?;
        atomic_write(&root_path, ca.root_pem.as_bytes())?;
        atomic_write(&inter_path, ca.intermediate_pem.as_bytes())?;
        atomic_write(&key_path, ca.intermediate_key.serialize_pem().as_bytes())?;
        info!(event = "ca_created", dir = %dir.display(), "Created new CA hierarchy");
        Ok(ca)
    }

    /// Fresh in-memory hierarchy.
    pub fn generate(leaf_validity_days: i64) -> Result<Self> {
        let root_key = KeyPair::generate()?;
        let root = ca_params("p2pshare Root CA", BasicConstraints::Unconstrained)?
            .self_signed(&root_key)?;

        let intermediate_key = KeyPair::generate()?;
        let intermediate = ca_params("p2pshare Intermediate CA", BasicConstraints::Constrained(0))?
            .signed_by(&intermediate_key, &root, &root_key)?;

        Ok(Self {
            root_pem: root.pem(),
            intermediate_pem: intermediate.pem(),
            intermediate,
            intermediate_key,
            leaf_validity: time::Duration::days(leaf_validity_days),
        })
    }

    pub fn root_pem(&self) -> &str {
        &self.root_pem
    }

    /// Validate and sign a peer's PEM signing request.
    ///
    /// The request must parse, carry a valid self-signature (proof of key
    /// possession) and name a non-empty subject common name. Requested
    /// extensions are discarded: the issued certificate always carries the
    /// peer SAN and peer key usages. Returns the PEM chain leaf → root.
    pub fn sign_request(&self, csr_pem: &str) -> Result<String, AuthorityError> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| AuthorityError::Malformed(e.to_string()))?;

        let common_name = csr
            .params
            .distinguished_name
            .get(&DnType::CommonName)
            .and_then(dn_text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(AuthorityError::MissingSubject)?;

        let mut subject = DistinguishedName::new();
        subject.push(DnType::CommonName, common_name);

        let params = &mut csr.params;
        params.distinguished_name = subject;
        params.subject_alt_names =
            CertificateParams::new(vec![PEER_SERVER_NAME.to_string()])?.subject_alt_names;
        self.apply_leaf_profile(params);

        let cert = csr.signed_by(&self.intermediate, &self.intermediate_key)?;
        Ok(self.chain_for(&cert))
    }

    /// Issue the tracker's own service certificate.
    pub fn issue_tracker_identity(&self) -> Result<ServiceIdentity, AuthorityError> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![TRACKER_SERVER_NAME.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, TRACKER_SERVER_NAME);
        self.apply_leaf_profile(&mut params);

        let cert = params.signed_by(&key, &self.intermediate, &self.intermediate_key)?;
        Ok(ServiceIdentity {
            key_pem: key.serialize_pem(),
            chain_pem: self.chain_for(&cert),
        })
    }

    /// Load the tracker service identity from `dir`, issuing one if absent.
    pub fn load_or_issue_tracker_identity(&self, dir: &Path) -> Result<ServiceIdentity> {
        let key_path = dir.join(TRACKER_KEY_FILE);
        let chain_path = dir.join(TRACKER_CHAIN_FILE);
        if key_path.exists() && chain_path.exists() {
            return Ok(ServiceIdentity {
                key_pem: std::fs::read_to_string(&key_path)?,
                chain_pem: std::fs::read_to_string(&chain_path)?,
            });
        }
        let id = self.issue_tracker_identity()?;
        atomic_write(&key_path, id.key_pem.as_bytes())?;
        atomic_write(&chain_path, id.chain_pem.as_bytes())?;
        Ok(id)
    }

    fn apply_leaf_profile(&self, params: &mut CertificateParams) {
        let now = OffsetDateTime::now_utc();
        params.is_ca = IsCa::NoCa;
        params.not_before = now - time::Duration::hours(1);
        params.not_after = now + self.leaf_validity;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.custom_extensions.clear();
    }

    fn chain_for(&self, leaf: &Certificate) -> String {
        let mut chain = leaf.pem();
        chain.push_str(&self.intermediate_pem);
        chain.push_str(&self.root_pem);
        chain
    }
}

fn ca_params(common_name: &str, constraints: BasicConstraints) -> Result<CertificateParams> {
    let now = OffsetDateTime::now_utc();
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.is_ca = IsCa::Ca(constraints);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = now - time::Duration::hours(1);
    params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);
    Ok(params)
}

pub(crate) fn dn_text(value: &DnValue) -> Option<&str> {
    match value {
        DnValue::Utf8String(s) => Some(s.as_str()),
        DnValue::PrintableString(s) => Some(s.as_str()),
        DnValue::Ia5String(s) => Some(s.as_str()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CERT_VALIDITY_DAYS;

    fn csr_with_cn(cn: &str) -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        if !cn.is_empty() {
            params.distinguished_name.push(DnType::CommonName, cn);
        }
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    #[test]
    fn test_sign_request_returns_three_cert_chain() {
        let ca = CertificateAuthority::generate(CERT_VALIDITY_DAYS).unwrap();
        let chain = ca.sign_request(&csr_with_cn("6f1c0c9e-peer")).unwrap();
        assert_eq!(chain.matches("BEGIN CERTIFICATE").count(), 3);
        assert!(chain.ends_with(ca.root_pem()));
    }

    #[test]
    fn test_sign_request_rejects_garbage() {
        let ca = CertificateAuthority::generate(CERT_VALIDITY_DAYS).unwrap();
        let err = ca.sign_request("this is not a CSR").unwrap_err();
        assert!(matches!(err, AuthorityError::Malformed(_)));
    }

    #[test]
    fn test_sign_request_rejects_tampered_csr() {
        let ca = CertificateAuthority::generate(CERT_VALIDITY_DAYS).unwrap();
        let pem = csr_with_cn("peer");
        let body: String = pem.lines().filter(|l| !l.starts_with("-----")).collect();
        // Flip a character in the middle of the base64 body.
        let mid = body.len() / 2;
        let mut chars: Vec<char> = body.chars().collect();
        chars[mid] = if chars[mid] == 'A' { 'B' } else { 'A' };
        let tampered = format!(
            "-----BEGIN CERTIFICATE REQUEST-----\n{}\n-----END CERTIFICATE REQUEST-----\n",
            chars.into_iter().collect::<String>()
        );
        assert!(ca.sign_request(&tampered).is_err());
    }

    #[test]
    fn test_sign_request_accepts_printable_common_name() {
        let ca = CertificateAuthority::generate(CERT_VALIDITY_DAYS).unwrap();
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, DnValue::PrintableString("peer-1".try_into().unwrap()));
        let pem = params.serialize_request(&key).unwrap().pem().unwrap();

        let chain = ca.sign_request(&pem).unwrap();
        assert_eq!(chain.matches("BEGIN CERTIFICATE").count(), 3);
    }

    #[test]
    fn test_sign_request_requires_common_name() {
        let ca = CertificateAuthority::generate(CERT_VALIDITY_DAYS).unwrap();
        let err = ca.sign_request(&csr_with_cn("")).unwrap_err();
        assert!(matches!(err, AuthorityError::MissingSubject));
    }

    #[test]
    fn test_keystore_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let first = CertificateAuthority::load_or_create(dir.path(), CERT_VALIDITY_DAYS).unwrap();
        assert!(dir.path().join(INTERMEDIATE_KEY_FILE).exists());

        let second = CertificateAuthority::load_or_create(dir.path(), CERT_VALIDITY_DAYS).unwrap();
        assert_eq!(first.root_pem(), second.root_pem());
        assert!(second.sign_request(&csr_with_cn("after-restart")).is_ok());

        let id = second.load_or_issue_tracker_identity(dir.path()).unwrap();
        let again = second.load_or_issue_tracker_identity(dir.path()).unwrap();
        assert_eq!(id.chain_pem, again.chain_pem);
    }
}
