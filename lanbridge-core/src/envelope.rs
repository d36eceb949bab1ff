//! Message envelope: the JSON object carried in every WebSocket frame.
//!
//! Inbound `file`/`image` envelopes carry the whole payload as base64 in
//! `payload`; once the hub has persisted it, the outbound form carries
//! `name` + `reference` instead.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Error text sent to a client whose frame could not be parsed.
pub const INVALID_FORMAT: &str = "Invalid message format";
/// Error text sent to a client that used a type the hub does not relay.
pub const UNKNOWN_TYPE: &str = "Unknown message type";
/// Error text sent when the payload store rejected a write.
pub const SAVE_FAILED: &str = "Failed to save file";

/// Envelope `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Text,
    File,
    Image,
    Error,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Text => "text",
            EnvelopeKind::File => "file",
            EnvelopeKind::Image => "image",
            EnvelopeKind::Error => "error",
        }
    }

    /// True for kinds whose payload goes through the payload store.
    pub fn is_binary(self) -> bool {
        matches!(self, EnvelopeKind::File | EnvelopeKind::Image)
    }

    /// `image` when the media type starts with `image/`, otherwise `file`.
    pub fn for_media_type(media_type: &str) -> Self {
        if media_type.to_ascii_lowercase().starts_with("image/") {
            EnvelopeKind::Image
        } else {
            EnvelopeKind::File
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeKind {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(EnvelopeKind::Text),
            "file" => Ok(EnvelopeKind::File),
            "image" => Ok(EnvelopeKind::Image),
            "error" => Ok(EnvelopeKind::Error),
            other => Err(EnvelopeError::UnknownType(other.to_string())),
        }
    }
}

/// One message on the wire. Absent fields are omitted when encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Producer clock, Unix milliseconds. Informational only: any JSON number
    /// is carried through as sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Number>,
}

/// Same shape as [`Envelope`] but with the tag left as a string, so an
/// unknown `type` can be told apart from a frame that is not JSON at all.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
}

impl Envelope {
    pub fn text(text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            kind: EnvelopeKind::Text,
            payload: Some(text.into()),
            name: None,
            reference: None,
            timestamp: Some(timestamp.into()),
        }
    }

    /// Error reply; carries no timestamp.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Error,
            payload: Some(message.into()),
            name: None,
            reference: None,
            timestamp: None,
        }
    }

    /// Inbound binary transfer: whole file contents base64-encoded into `payload`.
    pub fn upload(kind: EnvelopeKind, name: impl Into<String>, bytes: &[u8], timestamp: i64) -> Self {
        Self {
            kind,
            payload: Some(BASE64.encode(bytes)),
            name: Some(name.into()),
            reference: None,
            timestamp: Some(timestamp.into()),
        }
    }

    /// Outbound binary transfer: the payload has been persisted and is addressed by `reference`.
    pub fn stored(kind: EnvelopeKind, name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            kind,
            payload: None,
            name: Some(name.into()),
            reference: Some(reference.into()),
            timestamp: None,
        }
    }

    /// Parse one frame. A frame that is not a JSON object of the right shape is
    /// [`EnvelopeError::Malformed`]; a missing or unrecognized `type` is
    /// [`EnvelopeError::UnknownType`].
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        if !value.is_object() {
            return Err(EnvelopeError::Malformed("frame is not a JSON object".into()));
        }
        let raw: RawEnvelope =
            serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let kind = match raw.kind {
            Some(tag) => tag.parse()?,
            None => return Err(EnvelopeError::UnknownType(String::new())),
        };
        Ok(Self {
            kind,
            payload: raw.payload,
            name: raw.name,
            reference: raw.reference,
            // A non-numeric timestamp is dropped rather than rejected.
            timestamp: match raw.timestamp {
                Some(serde_json::Value::Number(n)) => Some(n),
                _ => None,
            },
        })
    }

    /// Producer timestamp in whole milliseconds, if it was a number.
    pub fn timestamp_millis(&self) -> Option<i64> {
        let n = self.timestamp.as_ref()?;
        n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check that the envelope is in the form a client may send to the hub.
    pub fn validate_inbound(&self) -> Result<(), EnvelopeError> {
        match self.kind {
            EnvelopeKind::Text => {
                if self.payload.is_none() {
                    return Err(EnvelopeError::Malformed("text envelope without payload".into()));
                }
                if self.name.is_some() || self.reference.is_some() {
                    return Err(EnvelopeError::Malformed(
                        "text envelope with file fields".into(),
                    ));
                }
                Ok(())
            }
            EnvelopeKind::File | EnvelopeKind::Image => {
                if self.payload.is_none() {
                    return Err(EnvelopeError::Malformed(format!(
                        "{} envelope without payload",
                        self.kind
                    )));
                }
                if self.name.as_deref().map_or(true, str::is_empty) {
                    return Err(EnvelopeError::Malformed(format!(
                        "{} envelope without name",
                        self.kind
                    )));
                }
                if self.reference.is_some() {
                    return Err(EnvelopeError::Malformed(format!(
                        "{} envelope carries both payload and reference",
                        self.kind
                    )));
                }
                Ok(())
            }
            // Errors flow hub -> client only.
            EnvelopeKind::Error => Err(EnvelopeError::UnknownType(self.kind.to_string())),
        }
    }

    /// Decode the base64 `payload` of a binary transfer.
    pub fn decode_payload(&self) -> Result<Vec<u8>, EnvelopeError> {
        let payload = self
            .payload
            .as_deref()
            .ok_or_else(|| EnvelopeError::Malformed("missing payload".into()))?;
        Ok(BASE64.decode(payload)?)
    }
}

/// Current wall clock in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Error parsing, validating or encoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown envelope type: {0:?}")]
    UnknownType(String),
    #[error("payload decode error: {0}")]
    PayloadDecode(#[from] base64::DecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl EnvelopeError {
    /// Text of the `error` envelope the hub sends back to the originator.
    pub fn reply_text(&self) -> &'static str {
        match self {
            EnvelopeError::Malformed(_)
            | EnvelopeError::PayloadDecode(_)
            | EnvelopeError::Encode(_) => INVALID_FORMAT,
            EnvelopeError::UnknownType(_) => UNKNOWN_TYPE,
        }
    }
}
