//! Handles a streaming function can hold on to its WebSocket connection.
//!
//! All writes go through a single writer task fed by the [`Outbox`] channel.
//! Reads go through the [`Inbox`], whose lock keeps the session loop and the
//! function from reading the same socket at once.

use crate::capture::Capture;
use crate::function::TransportError;
use crate::http::ResultEnvelope;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

const OUTBOX_CAPACITY: usize = 64;

/// Sending half of a connection.
#[derive(Clone)]
pub(crate) struct Outbox {
    tx: mpsc::Sender<Message>,
}

impl Outbox {
    /// Start the writer task for `sink`.
    pub(crate) fn spawn(mut sink: SplitSink<WebSocket, Message>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOX_CAPACITY);
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    debug!("WebSocket write failed: {}", err);
                    break;
                }
                if closing {
                    break;
                }
            }
        });
        (Self { tx }, writer)
    }

    pub(crate) async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub(crate) fn blocking_send_text(&self, text: String) -> Result<(), TransportError> {
        self.tx
            .blocking_send(Message::Text(text.into()))
            .map_err(|_| TransportError::Closed)
    }

    pub(crate) async fn send_envelope(&self, envelope: &ResultEnvelope) -> Result<(), TransportError> {
        self.send_text(envelope.to_text()).await
    }

    pub(crate) async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        self.tx
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// Receiving half of a connection, shared behind the per-connection lock.
#[derive(Clone)]
pub(crate) struct Inbox {
    stream: Arc<Mutex<SplitStream<WebSocket>>>,
}

impl Inbox {
    pub(crate) fn new(stream: SplitStream<WebSocket>) -> Self {
        Self {
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    /// Next text (or UTF-8 binary) frame. Ping and pong frames are skipped.
    pub(crate) async fn recv_text(&self) -> Result<String, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),
                Some(Ok(Message::Binary(data))) => {
                    return String::from_utf8(data.to_vec())
                        .map_err(|err| TransportError::Decode(err.to_string()))
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (f.code, f.reason.as_str().to_owned()))
                        .unwrap_or((1005, String::new()));
                    return Err(TransportError::Disconnected { code, reason });
                }
                Some(Err(err)) => return Err(TransportError::Io(err.to_string())),
                None => return Err(TransportError::Closed),
            }
        }
    }
}

/// Pushes result envelopes to the client while the function is still running.
///
/// Each sent value carries whatever the function printed since the previous
/// send in its `stdout`.
#[derive(Clone)]
pub struct StreamSender {
    outbox: Outbox,
    capture: Capture,
}

impl StreamSender {
    pub(crate) fn new(outbox: Outbox, capture: Capture) -> Self {
        Self { outbox, capture }
    }

    fn envelope<T: Serialize>(&self, value: T) -> Result<ResultEnvelope, TransportError> {
        let result =
            serde_json::to_value(value).map_err(|err| TransportError::Decode(err.to_string()))?;
        Ok(ResultEnvelope::ok(result, self.capture.drain()))
    }

    pub async fn send<T: Serialize>(&self, value: T) -> Result<(), TransportError> {
        let envelope = self.envelope(value)?;
        self.outbox.send_envelope(&envelope).await
    }

    /// For blocking functions; must not be called from async code.
    pub fn blocking_send<T: Serialize>(&self, value: T) -> Result<(), TransportError> {
        let envelope = self.envelope(value)?;
        self.outbox.blocking_send_text(envelope.to_text())
    }
}

impl fmt::Debug for StreamSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamSender")
    }
}

/// Raw access to the WebSocket for conversational functions.
///
/// Sends bypass the result envelope. Receives take the connection's receive
/// lock, so they never race the session loop.
#[derive(Clone)]
pub struct Connection {
    outbox: Outbox,
    inbox: Inbox,
    handle: Handle,
}

impl Connection {
    pub(crate) fn new(outbox: Outbox, inbox: Inbox, handle: Handle) -> Self {
        Self {
            outbox,
            inbox,
            handle,
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.outbox.send_text(text.into()).await
    }

    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(value).map_err(|err| TransportError::Decode(err.to_string()))?;
        self.outbox.send_text(text).await
    }

    pub async fn recv_text(&self) -> Result<String, TransportError> {
        self.inbox.recv_text().await
    }

    pub async fn recv_json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text).map_err(|err| TransportError::Decode(err.to_string()))
    }

    /// Send `prompt` and wait for the reply.
    pub async fn ask(&self, prompt: impl Into<String>) -> Result<String, TransportError> {
        self.send_text(prompt).await?;
        self.recv_text().await
    }

    /// For blocking functions; must not be called from async code.
    pub fn blocking_send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.outbox.blocking_send_text(text.into())
    }

    /// For blocking functions; must not be called from async code.
    pub fn blocking_recv_text(&self) -> Result<String, TransportError> {
        self.handle.block_on(self.inbox.recv_text())
    }

    /// For blocking functions; must not be called from async code.
    pub fn blocking_recv_json(&self) -> Result<Value, TransportError> {
        let text = self.blocking_recv_text()?;
        serde_json::from_str(&text).map_err(|err| TransportError::Decode(err.to_string()))
    }

    /// Blocking [`ask`](Self::ask).
    pub fn blocking_ask(&self, prompt: impl Into<String>) -> Result<String, TransportError> {
        self.blocking_send_text(prompt)?;
        self.blocking_recv_text()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Connection")
    }
}
