//! LAN tracker discovery over UDP broadcast.
//!
//! A peer with no configured tracker broadcasts `DISCOVER_TRACKER`; every
//! tracker on the segment answers `TRACKER|<registry port>|<enroll port>`
//! to the sender. The tracker address is the source address of the reply.

use crate::core::config::DISCOVERY_TIMEOUT;
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

pub const DISCOVER_REQUEST: &str = "DISCOVER_TRACKER";
const REPLY_PREFIX: &str = "TRACKER|";

/// Where a discovered tracker listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerLocation {
    pub registry: SocketAddr,
    pub enroll: SocketAddr,
}

pub fn encode_reply(registry_port: u16, enroll_port: u16) -> String {
    format!("{REPLY_PREFIX}{registry_port}|{enroll_port}")
}

/// Parse a reply into `(registry port, enroll port)`.
pub fn parse_reply(text: &str) -> Option<(u16, u16)> {
    let rest = text.trim().strip_prefix(REPLY_PREFIX)?;
    let (registry, enroll) = rest.split_once('|')?;
    Some((registry.parse().ok()?, enroll.parse().ok()?))
}

/// Answer discovery broadcasts on `socket` until `sos` fires.
pub async fn respond(socket: UdpSocket, registry_port: u16, enroll_port: u16, sos: SignalOfStop) {
    info!(
        event = "discovery_listening",
        addr = ?socket.local_addr().ok(),
        "Answering tracker discovery"
    );
    let reply = encode_reply(registry_port, enroll_port);
    let mut buf = [0u8; 256];
    loop {
        let received = tokio::select! {
            _ = sos.wait() => break,
            res = socket.recv_from(&mut buf) => res,
        };
        let (len, from) = match received {
            Ok(r) => r,
            Err(e) => {
                warn!(event = "discovery_recv_failure", error = %e, "Discovery receive failed");
                continue;
            }
        };
        if String::from_utf8_lossy(&buf[..len]).trim() != DISCOVER_REQUEST {
            continue;
        }
        debug!(event = "discovery_request", %from, "Discovery request");
        if let Err(e) = socket.send_to(reply.as_bytes(), from).await {
            warn!(event = "discovery_reply_failure", %from, error = %e, "Discovery reply failed");
        }
    }
}

/// Broadcast on the local segment and return the first tracker to answer.
pub async fn discover(port: u16) -> Result<Option<TrackerLocation>> {
    discover_at(SocketAddr::from((Ipv4Addr::BROADCAST, port)), DISCOVERY_TIMEOUT).await
}

/// Send one discovery request to `target` and wait up to `wait` for a
/// well-formed answer.
pub async fn discover_at(target: SocketAddr, wait: Duration) -> Result<Option<TrackerLocation>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("bind discovery socket")?;
    socket.set_broadcast(true)?;
    socket
        .send_to(DISCOVER_REQUEST.as_bytes(), target)
        .await
        .with_context(|| format!("send discovery to {target}"))?;

    let deadline = Instant::now() + wait;
    let mut buf = [0u8; 256];
    loop {
        let Ok(received) = timeout_at(deadline, socket.recv_from(&mut buf)).await else {
            debug!(event = "discovery_timeout", %target, "No tracker answered");
            return Ok(None);
        };
        let (len, from) = received?;
        let text = String::from_utf8_lossy(&buf[..len]);
        if let Some((registry, enroll)) = parse_reply(&text) {
            let location = TrackerLocation {
                registry: SocketAddr::new(from.ip(), registry),
                enroll: SocketAddr::new(from.ip(), enroll),
            };
            info!(event = "tracker_discovered", registry = %location.registry, enroll = %location.enroll, "Tracker discovered");
            return Ok(Some(location));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply(&encode_reply(6001, 9091)), Some((6001, 9091)));
        assert_eq!(parse_reply("TRACKER|1|2\n"), Some((1, 2)));
        assert_eq!(parse_reply("TRACKER|1"), None);
        assert_eq!(parse_reply("TRACKER|x|2"), None);
        assert_eq!(parse_reply("HELLO|1|2"), None);
    }

    #[tokio::test]
    async fn test_discover_over_loopback() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = socket.local_addr().unwrap();
        let sos = SignalOfStop::new();
        tokio::spawn(respond(socket, 6001, 9091, sos.clone()));

        let found = discover_at(target, Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(found.registry, "127.0.0.1:6001".parse().unwrap());
        assert_eq!(found.enroll, "127.0.0.1:9091".parse().unwrap());
        sos.cancel();
    }

    #[tokio::test]
    async fn test_discover_times_out_without_tracker() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = silent.local_addr().unwrap();
        let found = discover_at(target, Duration::from_millis(100)).await.unwrap();
        assert!(found.is_none());
    }
}
