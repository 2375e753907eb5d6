//! File naming and type inference for the media cache and outbound files.

use std::path::Path;

use crate::types::ContentKind;

/// Fallback MIME type for unknown files.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Known `(mime, extension)` pairs. First match wins in both directions.
const MIME_EXTENSIONS: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("image/jpeg", "jpeg"),
    ("image/png", "png"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
    ("video/mp4", "mp4"),
    ("video/3gpp", "3gp"),
    ("video/quicktime", "mov"),
    ("video/x-matroska", "mkv"),
    ("video/webm", "webm"),
    ("video/x-msvideo", "avi"),
    ("audio/ogg", "ogg"),
    ("audio/ogg", "opus"),
    ("audio/mpeg", "mp3"),
    ("audio/mp4", "m4a"),
    ("audio/aac", "aac"),
    ("audio/wav", "wav"),
    ("audio/flac", "flac"),
    ("application/pdf", "pdf"),
    ("application/zip", "zip"),
    ("text/plain", "txt"),
    ("text/csv", "csv"),
];

/// Make an identifier safe as a single path component.
///
/// Path separators and anything outside `[A-Za-z0-9@._-]` become `_`, and
/// leading dots are stripped so the result can never be `..` or hidden.
/// Deterministic: the same input always maps to the same name.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches('.');
    if sanitized.is_empty() {
        "_".to_owned()
    } else {
        sanitized.to_owned()
    }
}

/// Bare MIME type without parameters, lowercased (`audio/ogg; codecs=opus` → `audio/ogg`).
fn essence(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Cache file extension for a media item: from the MIME type, else from the
/// original file name, else `bin`.
pub fn extension_for(mime: &str, file_name: Option<&str>) -> String {
    let essence = essence(mime);
    if let Some((_, ext)) = MIME_EXTENSIONS.iter().find(|(m, _)| *m == essence) {
        return (*ext).to_owned();
    }
    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(sanitize_filename)
        .filter(|ext| ext != "_")
        .unwrap_or_else(|| "bin".to_owned())
}

/// MIME type implied by a file's extension.
pub fn mime_for_path(path: &Path) -> &'static str {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return OCTET_STREAM;
    };
    let ext = ext.to_ascii_lowercase();
    MIME_EXTENSIONS
        .iter()
        .find(|(_, e)| *e == ext)
        .map_or(OCTET_STREAM, |(m, _)| m)
}

/// Content kind implied by a file's extension; unknown files are documents.
pub fn kind_for_path(path: &Path) -> ContentKind {
    match mime_for_path(path) {
        OCTET_STREAM => ContentKind::Document,
        mime => ContentKind::from_mime(mime),
    }
}
