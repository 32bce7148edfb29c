//! WebSocket transport for the chat connection.
//!
//! `WsConnector` opens a WebSocket with `tokio-tungstenite` and adapts it to
//! the channel pair the connection manager expects: outbound text frames go
//! through an unbounded sender, and inbound frames, errors and the final
//! close are reported as [`TransportEvent`]s.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{Instrument, debug, info, info_span, warn};
use voicechat_core::{Connector, Transport, TransportError, TransportEvent};

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<Transport, TransportError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        info!(url, "WebSocket connected.");

        let (sender, mut outbound) = mpsc::unbounded_channel::<String>();
        let (events_tx, events) = mpsc::unbounded_channel();

        // Writer: runs until the owner drops its sender, then closes politely.
        tokio::spawn(
            async move {
                while let Some(frame) = outbound.recv().await {
                    if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                        warn!(error = %e, "Failed to write frame.");
                        break;
                    }
                }
                let _ = ws_tx.send(Message::Close(None)).await;
                let _ = ws_tx.close().await;
                debug!("Writer finished.");
            }
            .instrument(info_span!("ws_writer")),
        );

        // Reader: forwards text frames and always ends with `Closed`.
        tokio::spawn(
            async move {
                while let Some(next) = ws_rx.next().await {
                    match next {
                        Ok(Message::Text(text)) => {
                            if events_tx.send(TransportEvent::Text(text.to_string())).is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "Server closed the connection.");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "WebSocket read error.");
                            let _ = events_tx.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    }
                }
                let _ = events_tx.send(TransportEvent::Closed);
            }
            .instrument(info_span!("ws_reader")),
        );

        Ok(Transport { sender, events })
    }
}
