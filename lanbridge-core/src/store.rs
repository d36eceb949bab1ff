//! Payload store: where the hub hands off decoded file/image bytes.

use std::collections::BTreeMap;

/// Persists one payload under `name` and returns a reference clients can use
/// to fetch it. Location policy belongs to the implementation.
pub trait PayloadStore {
    fn persist(&mut self, name: &str, bytes: &[u8]) -> Result<String, StoreWriteError>;
}

impl<S: PayloadStore + ?Sized> PayloadStore for Box<S> {
    fn persist(&mut self, name: &str, bytes: &[u8]) -> Result<String, StoreWriteError> {
        (**self).persist(name, bytes)
    }
}

/// Error persisting a payload.
#[derive(Debug, thiserror::Error)]
pub enum StoreWriteError {
    #[error("failed to write {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid storage name {0:?}")]
    InvalidName(String),
    #[error("payload of {size} bytes exceeds remaining capacity {remaining}")]
    Full { size: usize, remaining: usize },
}

/// Reduce a client-supplied file name to a single safe path component.
/// Directory parts are dropped and control characters replaced; an empty
/// result becomes `upload`.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

/// In-memory store with an optional byte budget. References are `mem://<name>`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, Vec<u8>>,
    capacity: Option<usize>,
    used: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes once `capacity` bytes are stored.
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PayloadStore for MemoryStore {
    fn persist(&mut self, name: &str, bytes: &[u8]) -> Result<String, StoreWriteError> {
        if name.is_empty() || sanitize_file_name(name) != name {
            return Err(StoreWriteError::InvalidName(name.to_string()));
        }
        if let Some(capacity) = self.capacity {
            let remaining = capacity.saturating_sub(self.used);
            if bytes.len() > remaining {
                return Err(StoreWriteError::Full {
                    size: bytes.len(),
                    remaining,
                });
            }
        }
        if let Some(old) = self.entries.insert(name.to_string(), bytes.to_vec()) {
            self.used -= old.len();
        }
        self.used += bytes.len();
        Ok(format!("mem://{name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("pic.png"), "pic.png");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\notes.txt"), "notes.txt");
        assert_eq!(sanitize_file_name("dir/"), "upload");
        assert_eq!(sanitize_file_name(".."), "upload");
        assert_eq!(sanitize_file_name("a\nb"), "a_b");
    }

    #[test]
    fn memory_store_persists_and_references() {
        let mut store = MemoryStore::new();
        let r = store.persist("received_1_a.txt", b"hello").unwrap();
        assert_eq!(r, "mem://received_1_a.txt");
        assert_eq!(store.get("received_1_a.txt"), Some(&b"hello"[..]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn memory_store_rejects_path_names() {
        let mut store = MemoryStore::new();
        assert!(matches!(
            store.persist("../x", b"1"),
            Err(StoreWriteError::InvalidName(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn memory_store_capacity() {
        let mut store = MemoryStore::with_capacity_limit(8);
        store.persist("a", b"12345").unwrap();
        let err = store.persist("b", b"12345").unwrap_err();
        assert!(matches!(err, StoreWriteError::Full { size: 5, remaining: 3 }));
        store.persist("c", b"123").unwrap();
    }
}
