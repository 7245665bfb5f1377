//! The realtime relay seam.
//!
//! A shared-mode session talks to the relay through [`RelayConnector`]:
//! present a credential, get back a live bidirectional frame pipe. The
//! WebSocket transport lives in the relay server crate; [`InProcessRelay`]
//! wires sessions together inside one process for tests and local
//! multi-window setups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::protocol::RelayFrame;
use crate::error::{LatticeError, Result};

/// Outbound half of a relay connection. Cloneable so synchronous observer
/// callbacks can hold one.
#[derive(Clone, Debug)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<RelayFrame>,
}

impl RelaySender {
    pub fn send(&self, frame: RelayFrame) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| LatticeError::Network("relay connection closed".into()))
    }
}

/// A live, authorized connection to one page channel.
#[derive(Debug)]
pub struct RelayConnection {
    sender: RelaySender,
    inbound: mpsc::UnboundedReceiver<RelayFrame>,
}

impl RelayConnection {
    /// Assemble a connection from its raw halves. Transports (the
    /// in-process relay, the WebSocket client) build one of these after
    /// authorization succeeds.
    pub fn from_parts(
        outbound: mpsc::UnboundedSender<RelayFrame>,
        inbound: mpsc::UnboundedReceiver<RelayFrame>,
    ) -> Self {
        Self {
            sender: RelaySender { tx: outbound },
            inbound,
        }
    }

    /// Split into a cloneable sender and the inbound frame stream.
    pub fn into_parts(self) -> (RelaySender, mpsc::UnboundedReceiver<RelayFrame>) {
        (self.sender, self.inbound)
    }
}

/// Opens authorized connections to page channels.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Connect to `channel`, presenting `credential`. Authorization happens
    /// before any data is relayed; failure rejects the connection outright.
    async fn connect(&self, channel: &str, credential: &str) -> Result<RelayConnection>;
}

/// In-process relay hub.
///
/// Every channel is a broadcast bus; each connection gets a bridging task
/// pair that feeds its outbound frames onto the bus and its inbound pipe
/// from everyone else's frames. No persistence - that is the relay
/// server's job.
pub struct InProcessRelay {
    channels: Mutex<HashMap<String, broadcast::Sender<(u64, RelayFrame)>>>,
    /// When set, only this credential is admitted.
    required_token: RwLock<Option<String>>,
    next_peer: AtomicU64,
}

impl InProcessRelay {
    /// A relay admitting any non-empty credential.
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            required_token: RwLock::new(None),
            next_peer: AtomicU64::new(1),
        }
    }

    /// Restrict admission to one credential.
    pub fn require_token(&self, token: impl Into<String>) {
        *self.required_token.write().unwrap() = Some(token.into());
    }

    fn authorize(&self, credential: &str) -> Result<()> {
        if credential.is_empty() {
            return Err(LatticeError::AuthenticationRequired);
        }
        let required = self.required_token.read().unwrap();
        if let Some(expected) = required.as_deref()
            && expected != credential
        {
            return Err(LatticeError::Forbidden("relay channel".into()));
        }
        Ok(())
    }

    fn bus_for(&self, channel: &str) -> broadcast::Sender<(u64, RelayFrame)> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

impl Default for InProcessRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayConnector for InProcessRelay {
    async fn connect(&self, channel: &str, credential: &str) -> Result<RelayConnection> {
        self.authorize(credential)?;

        let bus = self.bus_for(channel);
        let peer_id = self.next_peer.fetch_add(1, Ordering::SeqCst);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<RelayFrame>();

        // Outbound bridge: this peer's frames onto the bus.
        let bus_tx = bus.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                // No receivers just means nobody else is in the room yet.
                let _ = bus_tx.send((peer_id, frame));
            }
        });

        // Inbound bridge: everyone else's frames into this peer's pipe.
        let mut bus_rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok((sender_id, frame)) => {
                        if sender_id != peer_id && in_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("in-process relay receiver lagged {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(RelayConnection::from_parts(out_tx, in_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_credential_rejected() {
        let relay = InProcessRelay::new();
        let err = relay.connect("page:1", "").await.unwrap_err();
        assert!(matches!(err, LatticeError::AuthenticationRequired));
    }

    #[tokio::test]
    async fn test_wrong_token_forbidden() {
        let relay = InProcessRelay::new();
        relay.require_token("secret");
        let err = relay.connect("page:1", "wrong").await.unwrap_err();
        assert!(matches!(err, LatticeError::Forbidden(_)));
        assert!(relay.connect("page:1", "secret").await.is_ok());
    }

    #[tokio::test]
    async fn test_frames_reach_other_peers_but_not_self() {
        let relay = InProcessRelay::new();
        let a = relay.connect("page:1", "t").await.unwrap();
        let b = relay.connect("page:1", "t").await.unwrap();

        let (a_tx, mut a_rx) = a.into_parts();
        let (_b_tx, mut b_rx) = b.into_parts();

        a_tx.send(RelayFrame::PeerLeft {
            user_id: "alice".into(),
        })
        .unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            got,
            RelayFrame::PeerLeft {
                user_id: "alice".into()
            }
        );

        // The sender must not hear its own frame back.
        let echo = tokio::time::timeout(std::time::Duration::from_millis(50), a_rx.recv()).await;
        assert!(echo.is_err());
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let relay = InProcessRelay::new();
        let a = relay.connect("page:1", "t").await.unwrap();
        let b = relay.connect("page:2", "t").await.unwrap();

        let (a_tx, _a_rx) = a.into_parts();
        let (_b_tx, mut b_rx) = b.into_parts();

        a_tx.send(RelayFrame::PeerLeft {
            user_id: "alice".into(),
        })
        .unwrap();

        let leaked = tokio::time::timeout(std::time::Duration::from_millis(50), b_rx.recv()).await;
        assert!(leaked.is_err());
    }
}
