//! Outbound mTLS channels.
//!
//! Connect and handshake are bounded separately. Failures are classified:
//! rustls rejections become `Trust`, everything on the way to an
//! established session is `Connectivity`.

use crate::core::config::{CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, IO_TIMEOUT};
use crate::core::error::TransferError;
use crate::core::protocol::codec::{read_frame, write_frame};
use crate::core::protocol::message::{Request, Response};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::trace;

#[derive(Clone)]
pub struct Connector {
    tls: TlsConnector,
    server_name: ServerName<'static>,
}

/// An established, authenticated request/response channel.
pub struct Channel {
    stream: TlsStream<TcpStream>,
}

impl Connector {
    /// `server_name` is the SAN every counterpart certificate must carry.
    pub fn new(config: Arc<ClientConfig>, server_name: &'static str) -> Result<Self, TransferError> {
        let server_name =
            ServerName::try_from(server_name).map_err(|e| TransferError::Trust(e.to_string()))?;
        Ok(Self {
            tls: TlsConnector::from(config),
            server_name,
        })
    }

    pub async fn connect(&self, addr: &str) -> Result<Channel, TransferError> {
        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransferError::Connectivity(format!("connect to {addr} timed out")))?
            .map_err(|e| TransferError::Connectivity(format!("{addr}: {e}")))?;
        let _ = tcp.set_nodelay(true);

        let stream = timeout(
            HANDSHAKE_TIMEOUT,
            self.tls.connect(self.server_name.clone(), tcp),
        )
        .await
        .map_err(|_| TransferError::Connectivity(format!("handshake with {addr} timed out")))??;

        trace!(event = "channel_established", addr, "Channel established");
        Ok(Channel { stream })
    }

    /// Open a channel, issue one request, close.
    pub async fn request(&self, addr: &str, request: &Request) -> Result<Response, TransferError> {
        let mut channel = self.connect(addr).await?;
        let response = channel.call(request).await;
        channel.close().await;
        response
    }
}

impl Channel {
    pub async fn call(&mut self, request: &Request) -> Result<Response, TransferError> {
        write_frame(&mut self.stream, request).await?;
        match read_frame::<_, Response>(&mut self.stream, IO_TIMEOUT).await? {
            Some(response) => Ok(response),
            None => Err(TransferError::Connectivity(
                "connection closed before response".into(),
            )),
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PEER_SERVER_NAME;
    use crate::core::connection::reactor::{
        ConnCtx, ConnState, Reactor, ReactorTimeouts, Reply, RequestHandler,
    };
    use crate::core::security::authority::CertificateAuthority;
    use crate::core::testutil::peer_trust;
    use crate::utils::sos::SignalOfStop;
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct Echo;

    impl RequestHandler for Echo {
        async fn handle(&self, _ctx: &ConnCtx, request: Request) -> Reply {
            match request {
                Request::Ping => Response::Pong {
                    name: "echo".into(),
                    load: 0,
                },
                other => Response::Error(format!("unsupported {}", other.kind())),
            }
            .into()
        }
    }

    async fn start(ca: &CertificateAuthority, timeouts: ReactorTimeouts) -> (String, Arc<Reactor<Echo>>, SignalOfStop) {
        let server = peer_trust(ca);
        let reactor = Reactor::with_timeouts("test", server.server, Arc::new(Echo), timeouts);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let sos = SignalOfStop::new();
        tokio::spawn(Arc::clone(&reactor).serve(listener, sos.clone()));
        (addr, reactor, sos)
    }

    #[tokio::test]
    async fn test_mutual_tls_round_trip() {
        let ca = CertificateAuthority::generate(365).unwrap();
        let (addr, _reactor, sos) = start(&ca, ReactorTimeouts::default()).await;

        let client = Connector::new(peer_trust(&ca).client, PEER_SERVER_NAME).unwrap();
        let mut channel = client.connect(&addr).await.unwrap();
        for _ in 0..3 {
            let resp = channel.call(&Request::Ping).await.unwrap();
            assert!(matches!(resp, Response::Pong { .. }));
        }
        let resp = channel.call(&Request::SharedList).await.unwrap();
        assert!(matches!(resp, Response::Error(_)));
        channel.close().await;
        sos.cancel();
    }

    #[tokio::test]
    async fn test_foreign_ca_is_trust_error() {
        let ca = CertificateAuthority::generate(365).unwrap();
        let other = CertificateAuthority::generate(365).unwrap();
        let (addr, reactor, sos) = start(&ca, ReactorTimeouts::default()).await;

        let client = Connector::new(peer_trust(&other).client, PEER_SERVER_NAME).unwrap();
        let err = match client.connect(&addr).await {
            Ok(mut ch) => ch.call(&Request::Ping).await.unwrap_err(),
            Err(e) => e,
        };
        assert!(matches!(err, TransferError::Trust(_)), "got {err:?}");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reactor
            .connections()
            .iter()
            .all(|(_, s)| *s == ConnState::Closed));
        sos.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_is_connectivity_error() {
        let ca = CertificateAuthority::generate(365).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = Connector::new(peer_trust(&ca).client, PEER_SERVER_NAME).unwrap();
        let err = client.request(&addr, &Request::Ping).await.unwrap_err();
        assert!(matches!(err, TransferError::Connectivity(_)));
    }

    #[tokio::test]
    async fn test_silent_client_hits_handshake_timeout() {
        let ca = CertificateAuthority::generate(365).unwrap();
        let timeouts = ReactorTimeouts {
            handshake: Duration::from_millis(100),
            idle: Duration::from_secs(5),
        };
        let (addr, reactor, sos) = start(&ca, timeouts).await;

        let _raw = TcpStream::connect(&addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(reactor
            .connections()
            .iter()
            .any(|(_, s)| *s == ConnState::Handshaking));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(reactor
            .connections()
            .iter()
            .all(|(_, s)| *s == ConnState::Closed));
        sos.cancel();
    }
}
