//! Duplex frame transport beneath the channel manager.
//!
//! A [`Connector`] opens one physical connection and hands back a
//! [`TransportLink`]: an outbound frame sender and an inbound event receiver.
//! Dropping the outbound sender closes the connection.

use crate::error::{Result, VoiceLinkError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// One discrete unit on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON control message.
    Text(String),
    /// Raw audio.
    Binary(Vec<u8>),
}

/// Close details reported by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: String,
}

/// Events delivered from an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Frame),
    /// Non-fatal transport error; a `Closed` event follows if the link died.
    Error(String),
    /// The connection is gone. Always the last event of a link.
    Closed(CloseInfo),
}

/// Both directions of an open connection.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens physical connections.
///
/// This trait allows swapping implementations (real WebSocket vs in-memory mock).
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `url`.
    ///
    /// # Errors
    /// Returns `VoiceLinkError::ChannelConnection` if the handshake fails.
    async fn open(&self, url: &str) -> Result<TransportLink>;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            VoiceLinkError::ChannelConnection {
                message: format!("WebSocket handshake failed: {}", e),
            }
        })?;

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();

        // Writer: runs until every sender is dropped, then performs the close handshake.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let message = match frame {
                    Frame::Text(text) => Message::Text(text),
                    Frame::Binary(data) => Message::Binary(data),
                };
                if let Err(e) = sink.send(message).await {
                    tracing::debug!("WebSocket write failed: {}", e);
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                tracing::debug!("WebSocket close failed: {}", e);
            }
        });

        // Reader
        tokio::spawn(async move {
            let mut close = CloseInfo {
                code: None,
                reason: "connection ended".to_string(),
            };
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        in_tx.send(TransportEvent::Frame(Frame::Text(text))).ok();
                    }
                    Ok(Message::Binary(data)) => {
                        in_tx.send(TransportEvent::Frame(Frame::Binary(data))).ok();
                    }
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            close = CloseInfo {
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.to_string(),
                            };
                        }
                        break;
                    }
                    // Ping/pong is answered by tungstenite itself.
                    Ok(_) => {}
                    Err(e) => {
                        in_tx.send(TransportEvent::Error(e.to_string())).ok();
                        close.reason = e.to_string();
                        break;
                    }
                }
            }
            in_tx.send(TransportEvent::Closed(close)).ok();
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
    async fn test_websocket_connector_reports_refused_connection() {
        // Port 9 (discard) is essentially never listening on loopback.
        let result = WebSocketConnector.open("ws://127.0.0.1:9/voice").await;
        match result {
            Err(VoiceLinkError::ChannelConnection { message }) => {
                assert!(message.contains("handshake failed"), "got: {}", message);
            }
            other => panic!("Expected ChannelConnection error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_websocket_connector_rejects_invalid_url() {
        let result = WebSocketConnector.open("not a url").await;
        assert!(result.is_err());
    }

    #[test]
    fn test_close_info_default_is_empty() {
        let info = CloseInfo::default();
        assert_eq!(info.code, None);
        assert!(info.reason.is_empty());
    }
}
