//! Bridge client: the peer-side API. Owns at most one transport session and
//! the reconnection controller that decides when to replace it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lanbridge_core::{
    now_millis, ConnectionState, Envelope, EnvelopeKind, ReconnectController, ReconnectPolicy,
    ReconnectStep, SubscriptionId, Subscriptions,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::file::FileHandle;
use crate::transport::{self, SessionReader, TransportSession};

pub const DEFAULT_URL: &str = "ws://localhost:8080";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Hub address, e.g. `ws://192.168.1.20:8080`.
    pub url: String,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_URL)
    }
}

/// Cheap to clone; clones share the same connection and handlers.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    controller: Mutex<ReconnectController>,
    session: Mutex<Option<Arc<TransportSession>>>,
    subscriptions: Mutex<Subscriptions>,
    /// Reads the current session and runs reconnects after it drops.
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

// Lock order: controller, then session.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BridgeClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: config.url,
                controller: Mutex::new(ReconnectController::new(config.reconnect)),
                session: Mutex::new(None),
                subscriptions: Mutex::new(Subscriptions::new()),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.controller).state()
    }

    /// Reconnect attempts made since the last successful connect.
    pub fn attempt(&self) -> u32 {
        lock(&self.inner.controller).attempt()
    }

    pub fn is_connected(&self) -> bool {
        self.current_session().is_ok()
    }

    /// Open a session to the configured hub. Resolves once the connection is
    /// established; a failure here is returned and never retried. Succeeds
    /// immediately if already connected. Cancels any pending reconnect and
    /// resets the attempt counter.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let epoch = {
            let mut controller = lock(&self.inner.controller);
            match controller.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => return Err(ClientError::ConnectInProgress),
                _ => controller.begin_connect(),
            }
        };
        self.abort_supervisor();

        let (session, reader) = match transport::connect(&self.inner.url).await {
            Ok(pair) => pair,
            Err(e) => {
                let _ = lock(&self.inner.controller).on_connect_failed(epoch);
                warn!(url = %self.inner.url, error = %e, "connect failed");
                return Err(e);
            }
        };
        let session = Arc::new(session);
        if !self.install(epoch, &session) {
            session.close().await;
            return Err(ClientError::Cancelled);
        }
        info!(url = %self.inner.url, session = %session.id(), "connected to hub");

        let handle = tokio::spawn(self.clone().supervise(epoch, session, reader));
        *lock(&self.inner.supervisor) = Some(handle);
        Ok(())
    }

    /// Close the session. Never triggers a reconnect; pending retries are cancelled.
    pub async fn disconnect(&self) {
        lock(&self.inner.controller).on_disconnect_requested();
        self.abort_supervisor();
        let session = lock(&self.inner.session).take();
        if let Some(session) = session {
            session.close().await;
            info!(session = %session.id(), "disconnected from hub");
        }
    }

    /// Send a `text` envelope stamped with the local clock. Best-effort: not
    /// queued and not retried.
    pub async fn send_text(&self, text: &str) -> Result<(), ClientError> {
        let session = self.current_session()?;
        let frame = Envelope::text(text, now_millis()).encode()?;
        session.send(frame).await?;
        debug!(session = %session.id(), len = text.len(), "text sent");
        Ok(())
    }

    /// Read the whole file and send it base64-encoded as one `file` or `image`
    /// envelope.
    pub async fn send_file(&self, file: &FileHandle) -> Result<(), ClientError> {
        let session = self.current_session()?;
        let bytes = tokio::fs::read(&file.path)
            .await
            .map_err(|source| ClientError::FileRead {
                path: file.path.clone(),
                source,
            })?;
        let envelope = Envelope::upload(file.kind(), file.name.clone(), &bytes, now_millis());
        session.send(envelope.encode()?).await?;
        info!(
            session = %session.id(),
            kind = %file.kind(),
            name = %file.name,
            bytes = bytes.len(),
            "file sent"
        );
        Ok(())
    }

    /// Register `handler` for inbound envelopes of `kind`. Handlers for the same
    /// kind run in registration order on the connection's read task.
    pub fn on_message<F>(&self, kind: EnvelopeKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        lock(&self.inner.subscriptions).subscribe(kind, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        lock(&self.inner.subscriptions).unsubscribe(id)
    }

    fn current_session(&self) -> Result<Arc<TransportSession>, ClientError> {
        let slot = lock(&self.inner.session);
        match slot.as_ref() {
            Some(session) if session.is_open() => Ok(Arc::clone(session)),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Make `session` current if `epoch` is still the live cycle.
    fn install(&self, epoch: u64, session: &Arc<TransportSession>) -> bool {
        let mut controller = lock(&self.inner.controller);
        if !controller.on_connected(epoch) {
            return false;
        }
        *lock(&self.inner.session) = Some(Arc::clone(session));
        true
    }

    fn clear_session(&self, session: &Arc<TransportSession>) {
        let mut slot = lock(&self.inner.session);
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *slot = None;
        }
    }

    fn abort_supervisor(&self) {
        if let Some(handle) = lock(&self.inner.supervisor).take() {
            handle.abort();
        }
    }

    /// Pump inbound frames until the session drops, then follow the
    /// controller's retry schedule. Retries run one at a time on this task.
    async fn supervise(
        self,
        epoch: u64,
        mut session: Arc<TransportSession>,
        mut reader: SessionReader,
    ) {
        loop {
            self.pump(&mut reader).await;
            session.mark_closed();
            self.clear_session(&session);

            let mut step = lock(&self.inner.controller).on_closed(epoch);
            if step != ReconnectStep::Stop {
                warn!(session = %session.id(), "connection to hub lost");
            }
            loop {
                let (attempt, delay) = match step {
                    ReconnectStep::Retry { attempt, delay, .. } => (attempt, delay),
                    ReconnectStep::GiveUp | ReconnectStep::Stop => return,
                };
                tokio::time::sleep(delay).await;
                let go = lock(&self.inner.controller).begin_retry(epoch);
                if !go {
                    return;
                }
                info!(attempt, url = %self.inner.url, "attempting to reconnect");
                match transport::connect(&self.inner.url).await {
                    Ok((next, next_reader)) => {
                        let next = Arc::new(next);
                        if !self.install(epoch, &next) {
                            next.close().await;
                            return;
                        }
                        session = next;
                        reader = next_reader;
                        break;
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "reconnect failed");
                        step = lock(&self.inner.controller).on_connect_failed(epoch);
                    }
                }
            }
        }
    }

    async fn pump(&self, reader: &mut SessionReader) {
        while let Some(frame) = reader.recv().await {
            match frame {
                Ok(text) => self.dispatch(&text),
                Err(e) => {
                    warn!(error = %e, "read from hub failed");
                    break;
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let envelope = match Envelope::decode(text.as_bytes()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "failed to parse message from hub");
                return;
            }
        };
        let handlers = lock(&self.inner.subscriptions).handlers_for(envelope.kind);
        debug!(kind = %envelope.kind, handlers = handlers.len(), "inbound envelope");
        for handler in handlers {
            handler(&envelope);
        }
    }
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish()
    }
}
