//! Typed subscription registry: envelope kind -> ordered handler list.

use std::collections::HashMap;
use std::sync::Arc;

use crate::envelope::{Envelope, EnvelopeKind};

/// Callback for inbound envelopes of one kind.
pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Returned by [`Subscriptions::subscribe`]; pass to `unsubscribe` to remove the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct Subscriptions {
    next_id: u64,
    handlers: HashMap<EnvelopeKind, Vec<(SubscriptionId, Handler)>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, kind: EnvelopeKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one handler. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for list in self.handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(h, _)| *h == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Handlers for `kind` in registration order. Cloned so the caller can
    /// invoke them without holding a lock on the registry.
    pub fn handlers_for(&self, kind: EnvelopeKind) -> Vec<Handler> {
        self.handlers
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Invoke every handler for the envelope's kind. Returns how many ran.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let handlers = self.handlers_for(envelope.kind);
        for handler in &handlers {
            handler(envelope);
        }
        handlers.len()
    }
}

impl std::fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<EnvelopeKind, usize> =
            self.handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("Subscriptions").field("handlers", &counts).finish()
    }
}
