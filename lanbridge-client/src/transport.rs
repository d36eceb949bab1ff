//! Transport session: one WebSocket connection to the hub, split into a
//! shared write half and an owned read half.

use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use lanbridge_core::{SessionId, SessionState};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write side of an open connection. Shared between senders; frames are
/// written one at a time.
#[derive(Debug)]
pub struct TransportSession {
    id: SessionId,
    sink: Mutex<SplitSink<WsStream, Message>>,
    open: AtomicBool,
}

/// Read side of a connection. Owned by the task that dispatches inbound frames.
#[derive(Debug)]
pub struct SessionReader {
    stream: SplitStream<WsStream>,
}

/// Open a connection to `url`. Resolves once the WebSocket handshake completes.
pub async fn connect(url: &str) -> Result<(TransportSession, SessionReader), ClientError> {
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    let (sink, stream) = ws.split();
    let session = TransportSession {
        id: SessionId::new(),
        sink: Mutex::new(sink),
        open: AtomicBool::new(true),
    };
    debug!(session = %session.id, url, "transport open");
    Ok((session, SessionReader { stream }))
}

impl TransportSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        if self.open.load(Ordering::Acquire) {
            SessionState::Open
        } else {
            SessionState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Send one text frame. Fails with `NotConnected` once the session is
    /// closed; a write error closes the session.
    pub async fn send(&self, frame: String) -> Result<(), ClientError> {
        if !self.is_open() {
            return Err(ClientError::NotConnected);
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Text(frame)).await {
            self.mark_closed();
            warn!(session = %self.id, error = %e, "send failed");
            return Err(e.into());
        }
        Ok(())
    }

    /// Mark closed without touching the socket (the read side saw the peer go away).
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Close the connection with a close frame. Idempotent.
    pub async fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!(session = %self.id, error = %e, "close handshake failed");
        }
    }
}

impl SessionReader {
    /// Next text payload from the hub. Binary frames are read as UTF-8 text;
    /// control frames are skipped. `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Result<String, ClientError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(data)) => {
                    return Some(
                        String::from_utf8(data)
                            .map_err(|e| ClientError::Transport(e.to_string())),
                    )
                }
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
