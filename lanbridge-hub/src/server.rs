//! WebSocket server: accept loop, per-connection reader/writer tasks, and the
//! single hub task that owns the live session set.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use lanbridge_core::{
    now_millis, Admission, OutboundAction, PayloadStore, PendingUpload, RelayHub, SessionId,
    StoreWriteError,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Connection lifecycle and traffic, as seen by the hub task. Events are
/// applied one at a time, in arrival order.
#[derive(Debug)]
pub enum HubEvent {
    Connected(SessionId, mpsc::UnboundedSender<String>),
    Message(SessionId, Vec<u8>),
    Disconnected(SessionId),
}

/// Accept connections on `listener` and relay between them. Runs until the
/// task is dropped; accept errors are logged and skipped. Payloads go to `store`.
pub async fn serve<S>(listener: TcpListener, store: S)
where
    S: PayloadStore + Send + 'static,
{
    let incoming = futures_util::stream::unfold(listener, |listener| async move {
        let next = listener.accept().await;
        Some((next, listener))
    });
    serve_incoming(incoming, store).await
}

/// Relay between connections yielded by `incoming`. Returns when the stream ends.
pub async fn serve_incoming<I, S>(incoming: I, store: S)
where
    I: Stream<Item = io::Result<(TcpStream, SocketAddr)>>,
    S: PayloadStore + Send + 'static,
{
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_hub(store, events_rx));
    futures_util::pin_mut!(incoming);
    while let Some(next) = incoming.next().await {
        match next {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(stream, peer, events_tx.clone()));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Own the relay hub and every session's outbound queue. Sends go through
/// unbounded per-session queues, so one slow peer never stalls the others.
/// Payload writes run on the blocking pool; their results come back on a
/// separate channel and are broadcast to whoever is live at that point.
pub async fn run_hub<S>(store: S, mut events: mpsc::UnboundedReceiver<HubEvent>)
where
    S: PayloadStore + Send + 'static,
{
    let store = Arc::new(Mutex::new(store));
    let mut hub = RelayHub::new();
    let mut outboxes: HashMap<SessionId, mpsc::UnboundedSender<String>> = HashMap::new();
    let (stored_tx, mut stored_rx) =
        mpsc::unbounded_channel::<(PendingUpload, Result<String, StoreWriteError>)>();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    HubEvent::Connected(session, tx) => {
                        outboxes.insert(session, tx);
                        hub.on_connect(session);
                    }
                    HubEvent::Message(session, bytes) => {
                        match hub.admit(session, &bytes, now_millis()) {
                            Admission::Deliver(actions) => deliver(&outboxes, actions),
                            Admission::Persist(upload) => {
                                let store = Arc::clone(&store);
                                let done = stored_tx.clone();
                                tokio::task::spawn_blocking(move || {
                                    let result = store
                                        .lock()
                                        .unwrap_or_else(PoisonError::into_inner)
                                        .persist(&upload.storage_name, &upload.bytes);
                                    let _ = done.send((upload, result));
                                });
                            }
                        }
                    }
                    HubEvent::Disconnected(session) => {
                        hub.on_disconnect(session);
                        outboxes.remove(&session);
                    }
                }
            }
            Some((upload, result)) = stored_rx.recv() => {
                deliver(&outboxes, hub.complete_upload(&upload, result));
            }
        }
    }
    debug!("hub event channel closed");
}

fn deliver(outboxes: &HashMap<SessionId, mpsc::UnboundedSender<String>>, actions: Vec<OutboundAction>) {
    for action in actions {
        let OutboundAction::Send(to, frame) = action;
        match outboxes.get(&to) {
            Some(tx) if tx.send(frame).is_ok() => {}
            _ => debug!(session = %to, "skipping send to closed session"),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::UnboundedSender<HubEvent>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    let session = SessionId::new();
    info!(%peer, session = %session, "client connected");

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if events.send(HubEvent::Connected(session, tx)).is_err() {
        return;
    }

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(frame)).await {
                debug!(session = %session, error = %e, "write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = source.next().await {
        let bytes = match msg {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Err(e) => {
                debug!(session = %session, error = %e, "read failed");
                break;
            }
        };
        if events.send(HubEvent::Message(session, bytes)).is_err() {
            break;
        }
    }
    let _ = events.send(HubEvent::Disconnected(session));
    info!(%peer, session = %session, "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanbridge_core::{Envelope, EnvelopeKind, MemoryStore};
    use std::time::Instant;

    /// Store whose writes take a while, like a slow disk.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    impl PayloadStore for SlowStore {
        fn persist(&mut self, name: &str, bytes: &[u8]) -> Result<String, StoreWriteError> {
            std::thread::sleep(self.delay);
            self.inner.persist(name, bytes)
        }
    }

    #[tokio::test]
    async fn closed_outbox_does_not_block_other_deliveries() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_hub(MemoryStore::new(), events_rx));

        let (a, b, c) = (SessionId::new(), SessionId::new(), SessionId::new());
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let (c_tx, mut c_rx) = mpsc::unbounded_channel();
        events_tx.send(HubEvent::Connected(a, a_tx)).unwrap();
        events_tx.send(HubEvent::Connected(b, b_tx)).unwrap();
        events_tx.send(HubEvent::Connected(c, c_tx)).unwrap();

        // b's writer is gone but the hub has not seen the disconnect yet.
        drop(b_rx);
        let frame = Envelope::text("still here", 1).encode().unwrap();
        events_tx
            .send(HubEvent::Message(a, frame.clone().into_bytes()))
            .unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), c_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Envelope::decode(got.as_bytes()).unwrap(), Envelope::decode(frame.as_bytes()).unwrap());
    }

    #[tokio::test]
    async fn error_reply_goes_only_to_sender() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_hub(MemoryStore::new(), events_rx));

        let (a, b) = (SessionId::new(), SessionId::new());
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        events_tx.send(HubEvent::Connected(a, a_tx)).unwrap();
        events_tx.send(HubEvent::Connected(b, b_tx)).unwrap();
        events_tx.send(HubEvent::Message(a, b"garbage".to_vec())).unwrap();

        let reply = tokio::time::timeout(std::time::Duration::from_secs(1), a_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, r#"{"type":"error","payload":"Invalid message format"}"#);
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_payload_write_does_not_hold_up_text() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let store = SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(600),
        };
        tokio::spawn(run_hub(store, events_rx));

        let (a, b, c) = (SessionId::new(), SessionId::new(), SessionId::new());
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (c_tx, _c_rx) = mpsc::unbounded_channel();
        events_tx.send(HubEvent::Connected(a, a_tx)).unwrap();
        events_tx.send(HubEvent::Connected(b, b_tx)).unwrap();
        events_tx.send(HubEvent::Connected(c, c_tx)).unwrap();

        let upload = Envelope::upload(EnvelopeKind::File, "big.bin", &[7u8; 64], 1)
            .encode()
            .unwrap();
        let started = Instant::now();
        events_tx.send(HubEvent::Message(a, upload.into_bytes())).unwrap();
        let text = Envelope::text("quick", 2).encode().unwrap();
        events_tx.send(HubEvent::Message(c, text.into_bytes())).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let first = Envelope::decode(first.as_bytes()).unwrap();
        assert_eq!(first.payload.as_deref(), Some("quick"));
        assert!(started.elapsed() < Duration::from_millis(400), "{:?}", started.elapsed());

        let second = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = Envelope::decode(second.as_bytes()).unwrap();
        assert_eq!(second.kind, EnvelopeKind::File);
        assert!(second.name.unwrap().ends_with("_big.bin"));
    }

    #[tokio::test]
    async fn accept_error_does_not_stop_serving() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let failed = futures_util::stream::iter([Err::<(TcpStream, SocketAddr), _>(
            io::Error::from(io::ErrorKind::ConnectionAborted),
        )]);
        let accepted = futures_util::stream::unfold(listener, |listener| async move {
            let next = listener.accept().await;
            Some((next, listener))
        });
        tokio::spawn(serve_incoming(failed.chain(accepted), MemoryStore::new()));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws.send(Message::Text("garbage".to_string())).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            reply,
            Message::Text(r#"{"type":"error","payload":"Invalid message format"}"#.to_string())
        );
    }
}
