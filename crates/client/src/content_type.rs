use std::path::Path;

/// MIME type sent when the extension is unknown.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Detects the MIME type from a file path extension.
pub fn detect_content_type(path: impl AsRef<Path>) -> Option<&'static str> {
    let ext = path
        .as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match ext.as_deref() {
        Some("png") => Some("image/png"),
        Some("jpg" | "jpeg") => Some("image/jpeg"),
        Some("webp") => Some("image/webp"),
        Some("gif") => Some("image/gif"),
        Some("svg") => Some("image/svg+xml"),
        Some("ico") => Some("image/x-icon"),
        Some("mp4") => Some("video/mp4"),
        Some("webm") => Some("video/webm"),
        Some("mov") => Some("video/quicktime"),
        Some("mp3") => Some("audio/mpeg"),
        Some("ogg") => Some("audio/ogg"),
        Some("wav") => Some("audio/wav"),
        Some("pdf") => Some("application/pdf"),
        Some("zip") => Some("application/zip"),
        Some("gz" | "tgz") => Some("application/gzip"),
        Some("json") => Some("application/json"),
        Some("xml") => Some("application/xml"),
        Some("txt" | "log") => Some("text/plain"),
        Some("csv") => Some("text/csv"),
        Some("html" | "htm") => Some("text/html"),
        Some("css") => Some("text/css"),
        Some("js") => Some("text/javascript"),
        _ => None,
    }
}

/// Like [`detect_content_type`], falling back to `application/octet-stream`.
pub fn content_type_or_default(path: impl AsRef<Path>) -> &'static str {
    detect_content_type(path).unwrap_or(DEFAULT_CONTENT_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions() {
        assert_eq!(detect_content_type("image.png"), Some("image/png"));
        assert_eq!(detect_content_type("photo.jpeg"), Some("image/jpeg"));
        assert_eq!(detect_content_type("clip.mp4"), Some("video/mp4"));
        assert_eq!(detect_content_type("/var/log/app.log"), Some("text/plain"));
        assert_eq!(detect_content_type("backup.tar.gz"), Some("application/gzip"));
    }

    #[test]
    fn case_insensitive() {
        assert_eq!(detect_content_type("IMAGE.PNG"), Some("image/png"));
        assert_eq!(detect_content_type("Report.PDF"), Some("application/pdf"));
    }

    #[test]
    fn unknown_falls_back() {
        assert_eq!(detect_content_type("noext"), None);
        assert_eq!(detect_content_type(""), None);
        assert_eq!(content_type_or_default("disk.img"), DEFAULT_CONTENT_TYPE);
        assert_eq!(content_type_or_default("a.txt"), "text/plain");
    }
}
