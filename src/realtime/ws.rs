//! WebSocket transport over tokio-tungstenite.
//!
//! Frames travel as binary protobuf; inbound text messages are accepted as
//! JSON frames for servers that speak the debug encoding.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use super::{ConnectionError, Transport, TransportLink};

pub struct WsTransport {
    url: String,
}

impl WsTransport {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn open(&self, token: &str) -> Result<TransportLink, ConnectionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ConnectionError::Rejected("token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = connect_async(request).await.map_err(handshake_error)?;
        let (mut ws_write, mut ws_read) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<frames::Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let send_task = async {
                while let Some(frame) = out_rx.recv().await {
                    let bytes = frames::encode_frame(&frame);
                    if ws_write.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_write.close().await;
            };

            let recv_task = async {
                while let Some(message) = ws_read.next().await {
                    let decoded = match message {
                        Ok(Message::Binary(bytes)) => frames::decode_frame(&bytes),
                        Ok(Message::Text(text)) => frames::decode_text(text.as_str()),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(error = %e, "ws recv error");
                            break;
                        }
                    };
                    match decoded {
                        Ok(frame) => {
                            if in_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping undecodable frame"),
                    }
                }
            };

            // Either side ending ends the link; dropping `in_tx` tells the manager.
            tokio::select! {
                () = send_task => debug!("ws send side finished"),
                () = recv_task => debug!("ws recv side finished"),
            }
        });

        Ok(TransportLink { outbound: out_tx, inbound: in_rx })
    }
}

fn handshake_error(error: WsError) -> ConnectionError {
    match &error {
        WsError::Http(response)
            if response.status() == StatusCode::UNAUTHORIZED || response.status() == StatusCode::FORBIDDEN =>
        {
            ConnectionError::Rejected(format!("handshake returned HTTP {}", response.status().as_u16()))
        }
        _ => ConnectionError::Transport(error.to_string()),
    }
}
