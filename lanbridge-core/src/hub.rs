//! Relay hub: host-driven fan-out. The host reports connection events and
//! inbound frames; the hub returns the frames to deliver and to whom.

use tracing::{debug, info, warn};

use crate::envelope::{self, Envelope, EnvelopeError, EnvelopeKind};
use crate::session::SessionId;
use crate::store::{sanitize_file_name, PayloadStore, StoreWriteError};

/// Something the host must do after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Deliver an encoded envelope to one session. Skip it if the session is no longer open.
    Send(SessionId, String),
}

/// Outcome of [`RelayHub::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Frames to deliver now (possibly none).
    Deliver(Vec<OutboundAction>),
    /// Decoded upload waiting for the payload store.
    Persist(PendingUpload),
}

/// An upload that has been validated and named but not yet written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub origin: SessionId,
    pub kind: EnvelopeKind,
    pub storage_name: String,
    pub bytes: Vec<u8>,
}

/// Why an inbound frame produced an error reply instead of a broadcast.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("store write failed: {0}")]
    Store(#[from] StoreWriteError),
}

impl RelayError {
    pub fn reply_text(&self) -> &'static str {
        match self {
            RelayError::Envelope(e) => e.reply_text(),
            RelayError::Store(_) => envelope::SAVE_FAILED,
        }
    }
}

/// Owns the live session set. Membership here is the only thing that decides
/// who receives a broadcast.
#[derive(Debug, Default)]
pub struct RelayHub {
    sessions: Vec<SessionId>,
    last_arrival_ms: i64,
    same_ms_uploads: u32,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session connected. Returns false if it was already live.
    pub fn on_connect(&mut self, session: SessionId) -> bool {
        if self.sessions.contains(&session) {
            return false;
        }
        self.sessions.push(session);
        info!(session = %session, peers = self.sessions.len(), "session joined");
        true
    }

    /// Session closed. Idempotent; returns whether it was live.
    pub fn on_disconnect(&mut self, session: SessionId) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| *s != session);
        let removed = self.sessions.len() != before;
        if removed {
            info!(session = %session, peers = self.sessions.len(), "session left");
        }
        removed
    }

    pub fn is_live(&self, session: SessionId) -> bool {
        self.sessions.contains(&session)
    }

    /// Live sessions in connect order.
    pub fn sessions(&self) -> &[SessionId] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Process one inbound frame, stamping arrival with the current clock.
    pub fn on_message<S: PayloadStore + ?Sized>(
        &mut self,
        origin: SessionId,
        raw: &[u8],
        store: &mut S,
    ) -> Vec<OutboundAction> {
        self.on_message_at(origin, raw, store, envelope::now_millis())
    }

    /// Process one inbound frame that arrived at `arrived_at_ms`, persisting any
    /// payload inline.
    ///
    /// On success the result holds one `Send` per live session other than
    /// `origin`. On any failure it holds a single `error` envelope addressed to
    /// `origin` and nothing else.
    pub fn on_message_at<S: PayloadStore + ?Sized>(
        &mut self,
        origin: SessionId,
        raw: &[u8],
        store: &mut S,
        arrived_at_ms: i64,
    ) -> Vec<OutboundAction> {
        match self.admit(origin, raw, arrived_at_ms) {
            Admission::Deliver(actions) => actions,
            Admission::Persist(upload) => {
                let result = store.persist(&upload.storage_name, &upload.bytes);
                self.complete_upload(&upload, result)
            }
        }
    }

    /// First half of message handling. Text and rejected frames resolve
    /// immediately; a decoded upload comes back as [`Admission::Persist`] so the
    /// host can write it wherever it likes and then call
    /// [`complete_upload`](Self::complete_upload).
    pub fn admit(&mut self, origin: SessionId, raw: &[u8], arrived_at_ms: i64) -> Admission {
        if !self.is_live(origin) {
            warn!(session = %origin, "dropping frame from session that is not live");
            return Admission::Deliver(Vec::new());
        }
        match self.classify(origin, raw, arrived_at_ms) {
            Ok(admission) => admission,
            Err(err) => {
                warn!(session = %origin, error = %err, "rejected inbound frame");
                Admission::Deliver(reply_error(origin, err.reply_text()))
            }
        }
    }

    /// Second half of upload handling: broadcast the stored reference, or report
    /// the store failure to the originator. Recipients are the sessions live now.
    pub fn complete_upload(
        &self,
        upload: &PendingUpload,
        result: Result<String, StoreWriteError>,
    ) -> Vec<OutboundAction> {
        let origin = upload.origin;
        let reference = match result {
            Ok(reference) => reference,
            Err(e) => {
                let err = RelayError::from(e);
                warn!(session = %origin, error = %err, "rejected inbound frame");
                return reply_error(origin, err.reply_text());
            }
        };
        info!(
            session = %origin,
            kind = %upload.kind,
            name = %upload.storage_name,
            bytes = upload.bytes.len(),
            "payload stored"
        );
        match Envelope::stored(upload.kind, upload.storage_name.clone(), reference).encode() {
            Ok(frame) => self.broadcast(origin, &frame),
            Err(e) => {
                warn!(session = %origin, error = %e, "failed to encode stored envelope");
                reply_error(origin, e.reply_text())
            }
        }
    }

    fn classify(
        &mut self,
        origin: SessionId,
        raw: &[u8],
        arrived_at_ms: i64,
    ) -> Result<Admission, RelayError> {
        let inbound = Envelope::decode(raw)?;
        inbound.validate_inbound()?;
        match inbound.kind {
            EnvelopeKind::Text => {
                let frame = inbound.encode()?;
                Ok(Admission::Deliver(self.broadcast(origin, &frame)))
            }
            EnvelopeKind::File | EnvelopeKind::Image => {
                let bytes = inbound.decode_payload()?;
                let original = inbound.name.as_deref().unwrap_or_default();
                let storage_name = self.storage_name(arrived_at_ms, original);
                Ok(Admission::Persist(PendingUpload {
                    origin,
                    kind: inbound.kind,
                    storage_name,
                    bytes,
                }))
            }
            EnvelopeKind::Error => Err(EnvelopeError::UnknownType(inbound.kind.to_string()).into()),
        }
    }

    /// One `Send` per live session except `origin`, from a snapshot of the live set.
    fn broadcast(&self, origin: SessionId, frame: &str) -> Vec<OutboundAction> {
        let actions: Vec<OutboundAction> = self
            .sessions
            .iter()
            .filter(|s| **s != origin)
            .map(|s| OutboundAction::Send(*s, frame.to_string()))
            .collect();
        debug!(session = %origin, recipients = actions.len(), "broadcast");
        actions
    }

    /// `received_<ms>_<name>`, with `-<n>` after the timestamp for the n-th
    /// extra upload in the same millisecond.
    fn storage_name(&mut self, arrived_at_ms: i64, original: &str) -> String {
        let seq = if arrived_at_ms == self.last_arrival_ms {
            self.same_ms_uploads = self.same_ms_uploads.saturating_add(1);
            self.same_ms_uploads
        } else {
            self.last_arrival_ms = arrived_at_ms;
            self.same_ms_uploads = 0;
            0
        };
        let name = sanitize_file_name(original);
        if seq == 0 {
            format!("received_{arrived_at_ms}_{name}")
        } else {
            format!("received_{arrived_at_ms}-{seq}_{name}")
        }
    }
}

fn reply_error(origin: SessionId, text: &str) -> Vec<OutboundAction> {
    match Envelope::error(text).encode() {
        Ok(frame) => vec![OutboundAction::Send(origin, frame)],
        Err(e) => {
            warn!(session = %origin, error = %e, "failed to encode error reply");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{INVALID_FORMAT, SAVE_FAILED, UNKNOWN_TYPE};
    use crate::store::MemoryStore;

    fn hub_with(n: usize) -> (RelayHub, Vec<SessionId>) {
        let mut hub = RelayHub::new();
        let ids: Vec<SessionId> = (0..n).map(|_| SessionId::new()).collect();
        for id in &ids {
            assert!(hub.on_connect(*id));
        }
        (hub, ids)
    }

    fn recipients(actions: &[OutboundAction]) -> Vec<SessionId> {
        actions
            .iter()
            .map(|OutboundAction::Send(to, _)| *to)
            .collect()
    }

    fn only_reply(actions: &[OutboundAction], to: SessionId) -> Envelope {
        assert_eq!(actions.len(), 1, "expected exactly one reply");
        let OutboundAction::Send(dest, frame) = &actions[0];
        assert_eq!(*dest, to);
        Envelope::decode(frame.as_bytes()).unwrap()
    }

    #[test]
    fn connect_and_disconnect_are_idempotent() {
        let (mut hub, ids) = hub_with(2);
        assert!(!hub.on_connect(ids[0]));
        assert_eq!(hub.len(), 2);
        assert!(hub.on_disconnect(ids[0]));
        assert!(!hub.on_disconnect(ids[0]));
        assert_eq!(hub.sessions(), &ids[1..]);
    }

    #[test]
    fn text_reaches_everyone_but_sender() {
        let (mut hub, ids) = hub_with(3);
        let mut store = MemoryStore::new();
        let sent = Envelope::text("hello", 1234);
        let raw = sent.encode().unwrap();
        let actions = hub.on_message(ids[0], raw.as_bytes(), &mut store);

        assert_eq!(recipients(&actions), vec![ids[1], ids[2]]);
        for OutboundAction::Send(_, frame) in &actions {
            assert_eq!(Envelope::decode(frame.as_bytes()).unwrap(), sent);
        }
        assert!(store.is_empty());
    }

    #[test]
    fn text_with_no_other_peers_goes_nowhere() {
        let (mut hub, ids) = hub_with(1);
        let raw = Envelope::text("alone", 1).encode().unwrap();
        assert!(hub.on_message(ids[0], raw.as_bytes(), &mut MemoryStore::new()).is_empty());
    }

    #[test]
    fn image_is_stored_and_rewritten() {
        let (mut hub, ids) = hub_with(2);
        let mut store = MemoryStore::new();
        let bytes: Vec<u8> = (1u8..=12).collect();
        let raw = Envelope::upload(EnvelopeKind::Image, "pic.png", &bytes, 1)
            .encode()
            .unwrap();
        let actions = hub.on_message_at(ids[0], raw.as_bytes(), &mut store, 1_700_000_000_000);

        assert_eq!(recipients(&actions), vec![ids[1]]);
        let OutboundAction::Send(_, frame) = &actions[0];
        let out = Envelope::decode(frame.as_bytes()).unwrap();
        assert_eq!(out.kind, EnvelopeKind::Image);
        assert_eq!(out.name.as_deref(), Some("received_1700000000000_pic.png"));
        assert_eq!(out.reference.as_deref(), Some("mem://received_1700000000000_pic.png"));
        assert!(out.payload.is_none());
        assert!(!frame.contains("payload"));

        assert_eq!(store.get("received_1700000000000_pic.png").unwrap(), &bytes[..]);
    }

    #[test]
    fn same_millisecond_uploads_get_distinct_names() {
        let (mut hub, ids) = hub_with(2);
        let mut store = MemoryStore::new();
        let raw = Envelope::upload(EnvelopeKind::File, "a.txt", b"abc", 1)
            .encode()
            .unwrap();
        hub.on_message_at(ids[0], raw.as_bytes(), &mut store, 42);
        hub.on_message_at(ids[1], raw.as_bytes(), &mut store, 42);
        hub.on_message_at(ids[0], raw.as_bytes(), &mut store, 43);
        let names: Vec<&str> = store.names().collect();
        assert_eq!(
            names,
            vec!["received_42-1_a.txt", "received_42_a.txt", "received_43_a.txt"]
        );
    }

    #[test]
    fn upload_name_is_sanitized() {
        let (mut hub, ids) = hub_with(2);
        let mut store = MemoryStore::new();
        let raw = Envelope::upload(EnvelopeKind::File, "../../secret.txt", b"x", 1)
            .encode()
            .unwrap();
        hub.on_message_at(ids[0], raw.as_bytes(), &mut store, 7);
        assert!(store.get("received_7_secret.txt").is_some());
    }

    #[test]
    fn unparseable_frame_gets_error_reply_only() {
        let (mut hub, ids) = hub_with(3);
        let actions = hub.on_message(ids[1], b"{not json", &mut MemoryStore::new());
        let reply = only_reply(&actions, ids[1]);
        assert_eq!(reply.kind, EnvelopeKind::Error);
        assert_eq!(reply.payload.as_deref(), Some(INVALID_FORMAT));
    }

    #[test]
    fn unknown_type_gets_error_reply_only() {
        let (mut hub, ids) = hub_with(2);
        let actions = hub.on_message(ids[0], br#"{"type":"video","payload":"x"}"#, &mut MemoryStore::new());
        let reply = only_reply(&actions, ids[0]);
        assert_eq!(reply.payload.as_deref(), Some(UNKNOWN_TYPE));

        let actions = hub.on_message(ids[0], br#"{"type":"error","payload":"x"}"#, &mut MemoryStore::new());
        assert_eq!(only_reply(&actions, ids[0]).payload.as_deref(), Some(UNKNOWN_TYPE));
    }

    #[test]
    fn bad_base64_is_reported_and_not_stored() {
        let (mut hub, ids) = hub_with(2);
        let mut store = MemoryStore::new();
        let raw = br#"{"type":"file","name":"a.bin","payload":"%%%"}"#;
        let actions = hub.on_message(ids[0], raw, &mut store);
        assert_eq!(only_reply(&actions, ids[0]).payload.as_deref(), Some(INVALID_FORMAT));
        assert!(store.is_empty());
    }

    #[test]
    fn store_failure_is_reported_and_not_broadcast() {
        let (mut hub, ids) = hub_with(3);
        let mut store = MemoryStore::with_capacity_limit(4);
        let raw = Envelope::upload(EnvelopeKind::File, "big.bin", &[0u8; 16], 1)
            .encode()
            .unwrap();
        let actions = hub.on_message(ids[2], raw.as_bytes(), &mut store);
        assert_eq!(only_reply(&actions, ids[2]).payload.as_deref(), Some(SAVE_FAILED));
    }

    #[test]
    fn disconnected_session_is_excluded_from_later_broadcasts() {
        let (mut hub, ids) = hub_with(3);
        hub.on_disconnect(ids[2]);
        let raw = Envelope::text("hi", 1).encode().unwrap();
        let actions = hub.on_message(ids[0], raw.as_bytes(), &mut MemoryStore::new());
        assert_eq!(recipients(&actions), vec![ids[1]]);
    }

    #[test]
    fn frames_from_unknown_sessions_are_dropped() {
        let (mut hub, _) = hub_with(2);
        let raw = Envelope::text("hi", 1).encode().unwrap();
        let actions = hub.on_message(SessionId::new(), raw.as_bytes(), &mut MemoryStore::new());
        assert!(actions.is_empty());
    }

    #[test]
    fn fractional_timestamp_is_relayed() {
        let (mut hub, ids) = hub_with(2);
        let raw = br#"{"type":"text","payload":"hi","timestamp":1700000000000.5}"#;
        let actions = hub.on_message(ids[0], raw, &mut MemoryStore::new());
        assert_eq!(recipients(&actions), vec![ids[1]]);
        let OutboundAction::Send(_, frame) = &actions[0];
        let out = Envelope::decode(frame.as_bytes()).unwrap();
        assert_eq!(out.kind, EnvelopeKind::Text);
        assert_eq!(out.payload.as_deref(), Some("hi"));
        assert_eq!(out.timestamp_millis(), Some(1_700_000_000_000));
    }

    #[test]
    fn json_array_is_rejected_not_broadcast() {
        let (mut hub, ids) = hub_with(2);
        let actions = hub.on_message(ids[0], br#"["text","hi"]"#, &mut MemoryStore::new());
        assert_eq!(only_reply(&actions, ids[0]).payload.as_deref(), Some(INVALID_FORMAT));
    }

    #[test]
    fn upload_is_admitted_then_completed() {
        let (mut hub, ids) = hub_with(3);
        let raw = Envelope::upload(EnvelopeKind::File, "a.txt", b"abc", 1)
            .encode()
            .unwrap();
        let upload = match hub.admit(ids[0], raw.as_bytes(), 9) {
            Admission::Persist(upload) => upload,
            other => panic!("expected persist, got {other:?}"),
        };
        assert_eq!(upload.origin, ids[0]);
        assert_eq!(upload.storage_name, "received_9_a.txt");
        assert_eq!(upload.bytes, b"abc");

        // Text admitted while the write is pending is delivered right away.
        let text = Envelope::text("meanwhile", 2).encode().unwrap();
        match hub.admit(ids[2], text.as_bytes(), 10) {
            Admission::Deliver(actions) => assert_eq!(recipients(&actions), vec![ids[0], ids[1]]),
            other => panic!("expected deliver, got {other:?}"),
        }

        // Recipients are whoever is live when the write finishes.
        hub.on_disconnect(ids[1]);
        let actions = hub.complete_upload(&upload, Ok("/uploads/received_9_a.txt".into()));
        assert_eq!(recipients(&actions), vec![ids[2]]);
    }

    #[test]
    fn failed_completion_replies_to_origin_only() {
        let (mut hub, ids) = hub_with(2);
        let raw = Envelope::upload(EnvelopeKind::Image, "p.png", b"x", 1)
            .encode()
            .unwrap();
        let Admission::Persist(upload) = hub.admit(ids[1], raw.as_bytes(), 3) else {
            panic!("expected persist");
        };
        let err = StoreWriteError::InvalidName(upload.storage_name.clone());
        let actions = hub.complete_upload(&upload, Err(err));
        assert_eq!(only_reply(&actions, ids[1]).payload.as_deref(), Some(SAVE_FAILED));
    }
}
