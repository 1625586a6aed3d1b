//! In-memory connector for exercising the channel without a network.

use crate::channel::transport::{CloseInfo, Connector, Frame, TransportEvent, TransportLink};
use crate::error::{Result, VoiceLinkError};
use crate::sync::lock;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// What the mock does with the next `open` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Open successfully.
    Accept,
    /// Open successfully after a handshake delay.
    AcceptAfter(Duration),
    /// Fail the handshake with the given message.
    Reject(String),
}

/// One recorded `open` call.
#[derive(Debug, Clone)]
pub struct MockAttempt {
    pub url: String,
    pub at: Instant,
}

/// The server side of an accepted mock connection.
#[derive(Debug)]
pub struct MockPeer {
    from_client: mpsc::UnboundedReceiver<Frame>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl MockPeer {
    /// Deliver a text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) {
        self.to_client
            .send(TransportEvent::Frame(Frame::Text(text.into())))
            .ok();
    }

    /// Deliver a JSON control message to the client.
    pub fn send_json<T: Serialize>(&self, message: &T) -> Result<()> {
        self.send_text(serde_json::to_string(message)?);
        Ok(())
    }

    /// Deliver a binary frame to the client.
    pub fn send_binary(&self, data: Vec<u8>) {
        self.to_client
            .send(TransportEvent::Frame(Frame::Binary(data)))
            .ok();
    }

    /// Report a non-fatal transport error.
    pub fn error(&self, message: impl Into<String>) {
        self.to_client
            .send(TransportEvent::Error(message.into()))
            .ok();
    }

    /// Close the connection from the server side.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.to_client
            .send(TransportEvent::Closed(CloseInfo {
                code: Some(code),
                reason: reason.into(),
            }))
            .ok();
    }

    /// Next frame the client sent, waiting for it.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// All frames the client has sent so far.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Text frames sent so far, parsed as JSON.
    pub fn drain_json(&mut self) -> Vec<serde_json::Value> {
        self.drain()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => serde_json::from_str(&text).ok(),
                Frame::Binary(_) => None,
            })
            .collect()
    }

    /// True once the client dropped its side of the link.
    pub fn is_closed_by_client(&self) -> bool {
        self.from_client.is_closed()
    }
}

/// Scripted connector that records every attempt.
#[derive(Debug)]
pub struct MockConnector {
    script: Mutex<VecDeque<MockOutcome>>,
    fallback: MockOutcome,
    attempts: Mutex<Vec<MockAttempt>>,
    peers: Mutex<VecDeque<MockPeer>>,
}

impl MockConnector {
    /// A connector that accepts every connection.
    pub fn accepting() -> Self {
        Self::with_fallback(MockOutcome::Accept)
    }

    /// A connector that rejects every connection.
    pub fn rejecting() -> Self {
        Self::with_fallback(MockOutcome::Reject("connection refused".to_string()))
    }

    fn with_fallback(fallback: MockOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            attempts: Mutex::new(Vec::new()),
            peers: Mutex::new(VecDeque::new()),
        }
    }

    /// Outcomes used, in order, before falling back to the default.
    pub fn with_script(self, outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        lock(&self.script).extend(outcomes);
        self
    }

    /// Every `open` call made so far.
    pub fn attempts(&self) -> Vec<MockAttempt> {
        lock(&self.attempts).clone()
    }

    pub fn attempt_count(&self) -> usize {
        lock(&self.attempts).len()
    }

    /// The oldest accepted connection not yet taken.
    pub fn take_peer(&self) -> Option<MockPeer> {
        lock(&self.peers).pop_front()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        lock(&self.attempts).push(MockAttempt {
            url: url.to_string(),
            at: Instant::now(),
        });
        let outcome = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match outcome {
            MockOutcome::Reject(message) => {
                return Err(VoiceLinkError::ChannelConnection { message });
            }
            MockOutcome::AcceptAfter(delay) => tokio::time::sleep(delay).await,
            MockOutcome::Accept => {}
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        lock(&self.peers).push_back(MockPeer {
            from_client: out_rx,
            to_client: in_tx,
        });
        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_fallback() {
        let connector = MockConnector::accepting()
            .with_script([MockOutcome::Reject("nope".to_string())]);

        assert!(connector.open("ws://a").await.is_err());
        assert!(connector.open("ws://b").await.is_ok());
        assert_eq!(connector.attempt_count(), 2);
        assert_eq!(connector.attempts()[1].url, "ws://b");
    }

    #[tokio::test]
    async fn test_peer_sees_client_frames() {
        let connector = MockConnector::accepting();
        let link = connector.open("ws://a").await.unwrap();
        let mut peer = connector.take_peer().unwrap();

        link.outbound.send(Frame::Text("{\"a\":1}".into())).unwrap();
        link.outbound.send(Frame::Binary(vec![1, 2])).unwrap();

        assert_eq!(peer.drain_json(), vec![serde_json::json!({"a": 1})]);
        drop(link);
        assert!(peer.is_closed_by_client());
    }

    #[tokio::test]
    async fn test_peer_events_reach_client() {
        let connector = MockConnector::accepting();
        let mut link = connector.open("ws://a").await.unwrap();
        let peer = connector.take_peer().unwrap();

        peer.send_binary(vec![9]);
        peer.close(1000, "bye");

        assert_eq!(
            link.inbound.recv().await,
            Some(TransportEvent::Frame(Frame::Binary(vec![9])))
        );
        assert_eq!(
            link.inbound.recv().await,
            Some(TransportEvent::Closed(CloseInfo {
                code: Some(1000),
                reason: "bye".to_string()
            }))
        );
    }

    #[tokio::test]
    async fn test_rejecting_connector_never_yields_peer() {
        let connector = MockConnector::rejecting();
        assert!(connector.open("ws://a").await.is_err());
        assert!(connector.take_peer().is_none());
    }
}
