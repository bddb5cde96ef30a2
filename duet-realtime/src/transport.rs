//! Text transport under the STOMP session.
//!
//! A [`Connector`] opens a [`Link`]: a pair of channels carrying whole
//! transport messages. The inbound channel closing means the transport is
//! gone; dropping the outbound sender closes it from our side.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use duet_core::error::{DuetError, DuetResult};

const CHANNEL_CAPACITY: usize = 64;

/// An open transport.
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<DuetResult<String>>,
}

/// Opens transports; swapped for an in-memory broker in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> DuetResult<Link>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> DuetResult<Link> {
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| DuetError::Connection("websocket connect timed out".into()))?
            .map_err(|e| DuetError::Connection(format!("websocket connect failed: {e}")))?;
        debug!("websocket open");

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<DuetResult<String>>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!("websocket write failed: {e}");
                    return;
                }
            }
            // All senders dropped: close from our side.
            let _ = write.close().await;
            debug!("websocket writer closed");
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let forwarded = match msg {
                    Ok(Message::Text(text)) => Ok(text),
                    Ok(Message::Binary(bytes)) => String::from_utf8(bytes.to_vec())
                        .map_err(|_| DuetError::Decode("non-utf8 binary frame".into())),
                    Ok(Message::Close(frame)) => {
                        debug!("websocket closed by server: {:?}", frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => Err(DuetError::Connection(format!("websocket error: {e}"))),
                };
                let fatal = matches!(forwarded, Err(DuetError::Connection(_)));
                if in_tx.send(forwarded).await.is_err() || fatal {
                    break;
                }
            }
            debug!("websocket reader finished");
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
