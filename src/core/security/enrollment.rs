//! Certificate enrollment over a server-authenticated TLS channel.
//!
//! Line-oriented text protocol:
//!
//! ```text
//! client: CERT_REQUEST|-----BEGIN CERTIFICATE REQUEST----- ... \n END_OF_REQUEST\n
//! server: CERT_RESPONSE|-----BEGIN CERTIFICATE----- ... \n END_OF_RESPONSE\n
//!     or: CERT_ERROR|<reason>\n END_OF_RESPONSE\n
//! ```
//!
//! The client trusts the bundled root; the server does not ask for a client
//! certificate, since the client has none yet.

use crate::core::config::{
    CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, IO_TIMEOUT, MAX_ENROLL_MESSAGE, TRACKER_SERVER_NAME,
};
use crate::core::connection::pool::WorkerPool;
use crate::core::security::authority::CertificateAuthority;
use crate::utils::sos::SignalOfStop;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

pub const REQUEST_PREFIX: &str = "CERT_REQUEST|";
pub const RESPONSE_PREFIX: &str = "CERT_RESPONSE|";
pub const ERROR_PREFIX: &str = "CERT_ERROR|";
pub const END_OF_REQUEST: &str = "END_OF_REQUEST";
pub const END_OF_RESPONSE: &str = "END_OF_RESPONSE";

#[derive(Debug, Error)]
pub enum EnrollmentError {
    /// Endpoint unreachable or timed out. Worth retrying.
    #[error("enrollment endpoint unreachable: {0}")]
    Unreachable(String),
    /// The endpoint failed to prove it belongs to the bundled root.
    #[error("enrollment endpoint not trusted: {0}")]
    Trust(String),
    /// The CA refused the request.
    #[error("signing request rejected: {0}")]
    Rejected(String),
    #[error("malformed enrollment message: {0}")]
    Malformed(String),
}

impl EnrollmentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EnrollmentError::Unreachable(_))
    }
}

// ── Message encoding ────────────────────────────────────────────────────────

pub fn encode_request(csr_pem: &str) -> String {
    format!("{REQUEST_PREFIX}{}\n{END_OF_REQUEST}\n", csr_pem.trim_end())
}

/// Extract the PEM body from a request (terminator already stripped).
pub fn parse_request(body: &str) -> Result<&str, EnrollmentError> {
    body.strip_prefix(REQUEST_PREFIX)
        .map(str::trim)
        .filter(|pem| !pem.is_empty())
        .ok_or_else(|| EnrollmentError::Malformed("expected CERT_REQUEST".into()))
}

pub fn encode_response(result: &Result<String, String>) -> String {
    match result {
        Ok(chain) => format!("{RESPONSE_PREFIX}{}\n{END_OF_RESPONSE}\n", chain.trim_end()),
        // Reasons travel on one line.
        Err(reason) => format!(
            "{ERROR_PREFIX}{}\n{END_OF_RESPONSE}\n",
            reason.replace(['\r', '\n'], " ")
        ),
    }
}

/// Decode a response body (terminator already stripped) into the PEM chain.
pub fn parse_response(body: &str) -> Result<String, EnrollmentError> {
    if let Some(chain) = body.strip_prefix(RESPONSE_PREFIX) {
        let chain = chain.trim();
        if chain.is_empty() {
            return Err(EnrollmentError::Malformed("empty certificate chain".into()));
        }
        return Ok(format!("{chain}\n"));
    }
    if let Some(reason) = body.strip_prefix(ERROR_PREFIX) {
        return Err(EnrollmentError::Rejected(reason.trim().to_string()));
    }
    Err(EnrollmentError::Malformed("unknown response tag".into()))
}

/// Read lines until `terminator`, returning everything before it.
async fn read_message<R>(reader: &mut BufReader<R>, terminator: &str) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut body = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream closed before {terminator}"),
            ));
        }
        if line.trim_end() == terminator {
            return Ok(body);
        }
        body.push_str(&line);
        if body.len() > MAX_ENROLL_MESSAGE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "enrollment message too large",
            ));
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────────────

/// Submit `csr_pem` to the enrollment endpoint at `addr` and return the
/// issued PEM chain (leaf → intermediate → root).
pub async fn request_certificate(
    addr: &str,
    anchor_config: Arc<ClientConfig>,
    csr_pem: &str,
) -> Result<String, EnrollmentError> {
    let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| EnrollmentError::Unreachable(format!("connect to {addr} timed out")))?
        .map_err(|e| EnrollmentError::Unreachable(e.to_string()))?;

    let server_name = ServerName::try_from(TRACKER_SERVER_NAME)
        .map_err(|e| EnrollmentError::Trust(e.to_string()))?;
    let tls = timeout(
        HANDSHAKE_TIMEOUT,
        TlsConnector::from(anchor_config).connect(server_name, tcp),
    )
    .await
    .map_err(|_| EnrollmentError::Unreachable("handshake timed out".into()))?
    .map_err(|e| EnrollmentError::Trust(e.to_string()))?;

    exchange(tls, csr_pem).await
}

async fn exchange<S>(stream: S, csr_pem: &str) -> Result<String, EnrollmentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let io = |e: std::io::Error| EnrollmentError::Unreachable(e.to_string());

    timeout(IO_TIMEOUT, async {
        let stream = reader.get_mut();
        stream.write_all(encode_request(csr_pem).as_bytes()).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| EnrollmentError::Unreachable("write timed out".into()))?
    .map_err(io)?;

    let body = timeout(IO_TIMEOUT, read_message(&mut reader, END_OF_RESPONSE))
        .await
        .map_err(|_| EnrollmentError::Unreachable("read timed out".into()))?
        .map_err(io)?;

    let _ = reader.get_mut().shutdown().await;
    parse_response(&body)
}

// ── Server ──────────────────────────────────────────────────────────────────

/// Accept enrollment connections until `sos` fires. Each request is signed
/// on the worker pool.
pub async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ca: Arc<CertificateAuthority>,
    pool: WorkerPool,
    sos: SignalOfStop,
) {
    info!(
        event = "enrollment_listening",
        addr = ?listener.local_addr().ok(),
        "Enrollment endpoint ready"
    );
    loop {
        let accepted = tokio::select! {
            _ = sos.wait() => break,
            res = listener.accept() => res,
        };
        let (tcp, remote) = match accepted {
            Ok(a) => a,
            Err(e) => {
                warn!(event = "enrollment_accept_failure", error = %e, "Accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let ca = Arc::clone(&ca);
        let pool = pool.clone();
        tokio::spawn(async move {
            let tls = match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    debug!(event = "enrollment_handshake_failure", %remote, error = %e, "Handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(event = "enrollment_handshake_timeout", %remote, "Handshake timed out");
                    return;
                }
            };
            if let Err(e) = handle_enrollment(tls, ca, pool).await {
                warn!(event = "enrollment_session_failure", %remote, error = %e, "Enrollment session failed");
            }
        });
    }
    info!(event = "enrollment_stopped", "Enrollment endpoint stopped");
}

async fn handle_enrollment<S>(
    stream: S,
    ca: Arc<CertificateAuthority>,
    pool: WorkerPool,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let body = timeout(IO_TIMEOUT, read_message(&mut reader, END_OF_REQUEST))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;

    let result = match parse_request(&body) {
        Ok(pem) => {
            let pem = pem.to_string();
            match pool.run(move || ca.sign_request(&pem)).await {
                Ok(Ok(chain)) => {
                    info!(event = "certificate_issued", "Signed peer certificate");
                    Ok(chain)
                }
                Ok(Err(e)) => {
                    warn!(event = "certificate_rejected", error = %e, "Rejected signing request");
                    Err(e.to_string())
                }
                Err(e) => Err(e.to_string()),
            }
        }
        Err(e) => Err(e.to_string()),
    };

    let stream = reader.get_mut();
    timeout(IO_TIMEOUT, async {
        stream.write_all(encode_response(&result).as_bytes()).await?;
        stream.flush().await?;
        stream.shutdown().await
    })
    .await
    .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CERT_VALIDITY_DAYS;

    #[test]
    fn test_request_framing() {
        let wire = encode_request("-----BEGIN CERTIFICATE REQUEST-----\nabc\n-----END CERTIFICATE REQUEST-----\n");
        assert!(wire.starts_with("CERT_REQUEST|-----BEGIN"));
        assert!(wire.ends_with("\nEND_OF_REQUEST\n"));

        let body = wire.trim_end().strip_suffix(END_OF_REQUEST).unwrap();
        assert!(parse_request(body).unwrap().ends_with("-----END CERTIFICATE REQUEST-----"));
        assert!(parse_request("HELLO|x").is_err());
        assert!(parse_request("CERT_REQUEST|   ").is_err());
    }

    #[test]
    fn test_response_parsing() {
        let ok = parse_response("CERT_RESPONSE|-----BEGIN CERTIFICATE-----\nx\n").unwrap();
        assert!(ok.starts_with("-----BEGIN CERTIFICATE-----"));

        let err = parse_response("CERT_ERROR|missing subject\n").unwrap_err();
        assert!(matches!(err, EnrollmentError::Rejected(r) if r == "missing subject"));
        assert!(parse_response("garbage").is_err());
    }

    #[test]
    fn test_error_reason_stays_on_one_line() {
        let wire = encode_response(&Err("bad\nrequest".into()));
        assert_eq!(wire, "CERT_ERROR|bad request\nEND_OF_RESPONSE\n");
    }

    #[tokio::test]
    async fn test_invalid_csr_yields_cert_error() {
        let ca = Arc::new(CertificateAuthority::generate(CERT_VALIDITY_DAYS).unwrap());
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(handle_enrollment(server, ca, WorkerPool::new(1)));

        let err = exchange(client, "not a pem").await.unwrap_err();
        assert!(matches!(err, EnrollmentError::Rejected(_)));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_valid_csr_yields_chain() {
        let ca = Arc::new(CertificateAuthority::generate(CERT_VALIDITY_DAYS).unwrap());
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "b8a7-peer");
        let csr = params.serialize_request(&key).unwrap().pem().unwrap();

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_enrollment(server, Arc::clone(&ca), WorkerPool::new(1)));
        let chain = exchange(client, &csr).await.unwrap();
        assert_eq!(chain.matches("BEGIN CERTIFICATE").count(), 3);
    }
}
