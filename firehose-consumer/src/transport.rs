use async_trait::async_trait;
use futures::StreamExt;
use ingest_common::types::FrameEvent;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::error::TransportError;

pub type FrameResult = Result<FrameEvent, TransportError>;

/// An open subscription. Frames arrive in relay order; `None` or an error means the
/// subscription is over and a new one has to be opened.
pub struct Subscription {
    frames: mpsc::Receiver<FrameResult>,
    reader: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(frames: mpsc::Receiver<FrameResult>, reader: Option<JoinHandle<()>>) -> Self {
        Self { frames, reader }
    }

    pub async fn next(&mut self) -> Option<FrameResult> {
        self.frames.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Read-only access to the relay's commit feed.
#[async_trait]
pub trait FirehoseTransport: Send + Sync {
    /// Open a subscription resuming after `cursor`, or from the start of the log without one.
    async fn subscribe(&self, cursor: Option<i64>) -> Result<Subscription, TransportError>;
}

/// Callers bound the handshake themselves; see `FirehoseConsumer`.
pub struct WebSocketTransport {
    relay_url: Url,
    buffer_size: usize,
}

impl WebSocketTransport {
    pub fn new(relay_url: &str, buffer_size: usize) -> Result<Self, TransportError> {
        let relay_url = Url::parse(relay_url).map_err(|source| TransportError::InvalidUrl {
            url: relay_url.to_owned(),
            source,
        })?;

        Ok(Self {
            relay_url,
            buffer_size: buffer_size.max(1),
        })
    }

    pub fn subscribe_url(&self, cursor: Option<i64>) -> Url {
        let mut url = self.relay_url.clone();
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "cursor")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        url.set_query(None);
        if !retained.is_empty() || cursor.is_some() {
            let mut query = url.query_pairs_mut();
            query.extend_pairs(retained);
            if let Some(cursor) = cursor {
                query.append_pair("cursor", &cursor.to_string());
            }
        }

        url
    }
}

#[async_trait]
impl FirehoseTransport for WebSocketTransport {
    async fn subscribe(&self, cursor: Option<i64>) -> Result<Subscription, TransportError> {
        let url = self.subscribe_url(cursor);

        let (stream, _response) = connect_async(url.as_str()).await?;

        info!(relay = %self.relay_url, ?cursor, "subscribed to relay");

        let (sender, receiver) = mpsc::channel(self.buffer_size);
        let reader = tokio::spawn(read_frames(stream, sender));

        Ok(Subscription::new(receiver, Some(reader)))
    }
}

/// Forward decoded frames until the socket ends. Nothing is ever written to the socket from here.
async fn read_frames(
    mut stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    sender: mpsc::Sender<FrameResult>,
) {
    while let Some(message) = stream.next().await {
        let frame = match message {
            Ok(Message::Text(text)) => Ok(FrameEvent::decode(&text)),
            Ok(Message::Binary(bytes)) => Ok(match std::str::from_utf8(&bytes) {
                Ok(text) => FrameEvent::decode(text),
                Err(e) => FrameEvent::Malformed {
                    seq: None,
                    raw: String::from_utf8_lossy(&bytes).into_owned(),
                    error: e.to_string(),
                },
            }),
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| format!("{} {}", f.code, f.reason))
                    .unwrap_or_else(|| "closed by relay".to_owned());
                forward(&sender, Err(TransportError::Closed(reason))).await;
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                forward(&sender, Err(e.into())).await;
                return;
            }
        };

        if !forward(&sender, frame).await {
            debug!("frame receiver gone, stopping reader");
            return;
        }
    }

    forward(&sender, Err(TransportError::Closed("stream ended".to_owned()))).await;
}

async fn forward(sender: &mpsc::Sender<FrameResult>, frame: FrameResult) -> bool {
    sender.send(frame).await.is_ok()
}
