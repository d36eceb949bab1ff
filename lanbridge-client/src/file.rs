//! Local files queued for `send_file`.

use std::path::{Path, PathBuf};

use lanbridge_core::EnvelopeKind;

const OCTET_STREAM: &str = "application/octet-stream";

/// A file to send: where to read it, the name peers see, and its declared media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub path: PathBuf,
    pub name: String,
    pub media_type: String,
}

impl FileHandle {
    /// Name from the last path component, media type guessed from the extension.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let media_type = guess_media_type(&path).to_string();
        Self {
            path,
            name,
            media_type,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = media_type.into();
        self
    }

    /// `image` for `image/*` media types, `file` otherwise.
    pub fn kind(&self) -> EnvelopeKind {
        EnvelopeKind::for_media_type(&self.media_type)
    }
}

fn guess_media_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "zip" => "application/zip",
        _ => OCTET_STREAM,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_by_extension() {
        let f = FileHandle::from_path("/tmp/shots/pic.PNG");
        assert_eq!(f.name, "pic.PNG");
        assert_eq!(f.media_type, "image/png");
        assert_eq!(f.kind(), EnvelopeKind::Image);
    }

    #[test]
    fn unknown_extension_is_plain_file() {
        let f = FileHandle::from_path("notes.tar.xz");
        assert_eq!(f.media_type, OCTET_STREAM);
        assert_eq!(f.kind(), EnvelopeKind::File);
        let f = FileHandle::from_path("README");
        assert_eq!(f.kind(), EnvelopeKind::File);
    }

    #[test]
    fn declared_type_wins() {
        let f = FileHandle::from_path("capture.bin").with_media_type("image/heic");
        assert_eq!(f.kind(), EnvelopeKind::Image);
        let f = FileHandle::from_path("pic.png").with_media_type("application/octet-stream");
        assert_eq!(f.kind(), EnvelopeKind::File);
    }
}
