//! Per-resource subscription channels.
//!
//! A [`Transport`] opens one bidirectional [`Channel`] and completes the
//! `Subscribe`/`Ack` handshake before returning it. Once connected, the
//! channel is just a pair of mpsc queues; the connection manager never sees
//! sockets.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::model::ResourceId;
use crate::protocol::{ChannelMessage, ProtocolError};

/// An established subscription channel.
///
/// `incoming` yields `None` once the remote side is gone.
#[derive(Debug)]
pub struct Channel {
    pub outgoing: mpsc::Sender<ChannelMessage>,
    pub incoming: mpsc::Receiver<ChannelMessage>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("channel closed before the subscription was acknowledged")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Something that can open a subscription channel for a resource.
pub trait Transport: Send + Sync + 'static {
    fn connect(
        &self,
        resource: &ResourceId,
    ) -> impl Future<Output = Result<Channel, TransportError>> + Send;
}

/// WebSocket transport: one socket per resource at `{base_url}/{resource}`,
/// binary frames carrying bincode-encoded [`ChannelMessage`]s.
#[derive(Debug, Clone)]
pub struct WsTransport {
    base_url: String,
    capacity: usize,
}

impl WsTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), capacity: 256 }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn url_for(&self, resource: &ResourceId) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), resource)
    }
}

impl Transport for WsTransport {
    async fn connect(&self, resource: &ResourceId) -> Result<Channel, TransportError> {
        let url = self.url_for(resource);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let subscribe = ChannelMessage::Subscribe { resource: resource.clone() }.encode()?;
        ws_writer
            .send(Message::Binary(subscribe.into()))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        // Handshake: everything before the ack is unexpected.
        loop {
            match ws_reader.next().await {
                Some(Ok(Message::Binary(data))) => {
                    match ChannelMessage::decode(&data)? {
                        ChannelMessage::Ack { resource: acked } if &acked == resource => break,
                        other => {
                            return Err(ProtocolError::UnexpectedMessage(other.kind()).into());
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    return Err(TransportError::Closed);
                }
                Some(Ok(_)) => {}
            }
        }

        let (out_tx, mut out_rx) = mpsc::channel::<ChannelMessage>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<ChannelMessage>(self.capacity);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let data = match msg.encode() {
                    Ok(data) => data,
                    Err(e) => {
                        log::warn!("Dropping unencodable {} message: {e}", msg.kind());
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode frames until the socket closes
        let resource = resource.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => {
                        match ChannelMessage::decode(&data) {
                            Ok(msg) => {
                                if in_tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::debug!("Ignoring bad frame on {resource}: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::debug!("WebSocket reader for {resource} finished");
        });

        Ok(Channel { outgoing: out_tx, incoming: in_rx })
    }
}
