//! Abstract transport interface
//!
//! A transport is "something that produces peer discoveries and offers a
//! request/response byte channel to a peer." The specific radio (BLE,
//! Wi-Fi Direct, Wi-Fi Aware, LAN) is modeled behind this one trait so the
//! exchange scheduler never has to know which radio it's driving.

use async_trait::async_trait;
use thiserror::Error;

use crate::peer::TransportKind;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect timeout")]
    ConnectTimeout,
    #[error("connection reset")]
    ConnectionReset,
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("framing error: {0}")]
    Framing(#[from] crate::framing::FrameError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A peer discovery surfaced by a transport, before any handshake has
/// confirmed its full identity.
#[derive(Clone, Debug)]
pub struct Discovery {
    pub address: String,
    /// Full id, if the transport can supply one directly, or a short
    /// prefix (e.g. the first bytes of a BLE advertisement).
    pub public_id_hint: Option<String>,
    pub signal_strength: Option<i32>,
    pub port: Option<u16>,
}

/// Events a transport reports to its owner.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    PeerDiscovered(Discovery),
    Connected { address: String },
    Disconnected { address: String },
}

/// The abstract interface every concrete radio implements. Transports
/// MUST NOT assume stable MAC addresses.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Send `payload` to `peer_address` and wait for the response bytes,
    /// honoring the length-prefixed framing contract.
    async fn request(&self, peer_address: &str, payload: Vec<u8>) -> Result<Vec<u8>, TransportError>;

    /// Drain buffered discovery/connection events since the last poll.
    /// Transports that push events onto an internal channel rather than
    /// requiring polling may return an empty vec here and rely on a
    /// separately-spawned task to report into the peer registry directly.
    async fn poll_events(&self) -> Vec<TransportEvent>;
}

/// Computes the reply to one inbound exchange request. Implemented by the daemon's exchange responder; transports
/// are generic over it so the same handler serves every radio.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, peer_address: &str, payload: Vec<u8>) -> Vec<u8>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct EchoTransport {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for EchoTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Lan
        }

        async fn request(&self, _peer_address: &str, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(payload)
        }

        async fn poll_events(&self) -> Vec<TransportEvent> {
            vec![]
        }
    }

    #[tokio::test]
    async fn trait_object_dispatch_works() {
        let calls = Arc::new(AtomicUsize::new(0));
        let transport: Box<dyn Transport> = Box::new(EchoTransport { calls: calls.clone() });

        let reply = transport.request("10.0.0.5:9000", b"ping".to_vec()).await.unwrap();
        assert_eq!(reply, b"ping");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.kind(), TransportKind::Lan);
    }
}
