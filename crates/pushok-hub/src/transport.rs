//! Frame transport between the client and the hub.
//!
//! [`HubClient`](crate::client::HubClient) only sees a pair of channels. The
//! WebSocket implementation pumps them from a `tokio-tungstenite` stream; the
//! test suite plugs in an in-process hub instead.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{HubError, HubResult};

const CHANNEL_CAPACITY: usize = 256;

/// One WebSocket data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Aborts the pump tasks of a transport when dropped.
#[derive(Debug, Default)]
pub struct TaskGuard {
    tasks: Vec<JoinHandle<()>>,
}

impl TaskGuard {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// An open link. Dropping `outgoing` closes the socket; `incoming` yields
/// `None` once the peer is gone.
#[derive(Debug)]
pub struct Transport {
    pub outgoing: mpsc::Sender<Frame>,
    pub incoming: mpsc::Receiver<Frame>,
    pub guard: TaskGuard,
}

/// Opens transports. One call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> HubResult<Transport>;
}

/// `ws://` / `wss://` connector with periodic keep-alive pings.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    ping_interval: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, ping_interval: Duration) -> Self {
        Self {
            url: url.into(),
            ping_interval,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> HubResult<Transport> {
        debug!(url = %self.url, "Opening WebSocket");
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| HubError::Transport(format!("connect {}: {}", self.url, e)))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);

        let ping_interval = self.ping_interval;
        let writer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    frame = out_rx.recv() => {
                        let message = match frame {
                            Some(Frame::Text(text)) => Message::Text(text),
                            Some(Frame::Binary(data)) => Message::Binary(data),
                            None => {
                                let _ = write.send(Message::Close(None)).await;
                                break;
                            }
                        };
                        if let Err(e) = write.send(message).await {
                            warn!("WebSocket send failed: {}", e);
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            warn!("WebSocket ping failed: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => Frame::Text(text),
                    Ok(Message::Binary(data)) => Frame::Binary(data),
                    Ok(Message::Close(reason)) => {
                        info!("WebSocket closed by peer: {:?}", reason);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("WebSocket receive failed: {}", e);
                        break;
                    }
                };
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        Ok(Transport {
            outgoing: out_tx,
            incoming: in_rx,
            guard: TaskGuard::new(vec![reader, writer]),
        })
    }
}
