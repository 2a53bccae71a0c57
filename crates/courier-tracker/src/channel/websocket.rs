//! WebSocket implementation of [`Transport`].

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use super::protocol::{decode_inbound, InboundEvent, OutboundEvent};
use super::{Credential, Link, Transport};
use crate::error::{Error, Result};

/// Opens the event channel as a WebSocket with bearer authentication.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: Url,
    outbound_buffer: usize,
}

impl WebSocketTransport {
    /// Create a transport for the given `ws://` or `wss://` endpoint.
    #[must_use]
    pub fn new(url: Url, outbound_buffer: usize) -> Self {
        Self {
            url,
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    /// The endpoint this transport dials.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    fn connect_error(&self, message: impl std::fmt::Display) -> Error {
        Error::channel_connect(self.url.as_str(), message.to_string())
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, credential: &Credential) -> Result<Link> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| self.connect_error(e))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
            .map_err(|_| self.connect_error("credential is not a valid header value"))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        debug!(url = %self.url, "Opening WebSocket");
        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| self.connect_error(e))?;
        info!(url = %self.url, status = %response.status(), "WebSocket handshake complete");

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundEvent>(self.outbound_buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundEvent>(self.outbound_buffer);

        tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize {}: {}", event.name(), e);
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    debug!("WebSocket send failed, channel closed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match decode_inbound(text.as_str()) {
                        Ok(event) => {
                            if inbound_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("Ignoring unhandled inbound frame: {}", e),
                    },
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "Server closed the event channel");
                        break;
                    }
                    // Pings are answered by tungstenite itself.
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
