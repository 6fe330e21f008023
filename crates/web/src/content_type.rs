//! Content types of served files, by extension.

use std::path::Path;

use mime::Mime;

/// Extension table, lower case. Anything missing is served as `application/octet-stream`.
static EXTENSIONS: &[(&str, &str)] = &[
    ("htm", "text/html; charset=utf-8"),
    ("html", "text/html; charset=utf-8"),
    ("css", "text/css; charset=utf-8"),
    ("js", "application/javascript; charset=utf-8"),
    ("mjs", "application/javascript; charset=utf-8"),
    ("json", "application/json"),
    ("txt", "text/plain; charset=utf-8"),
    ("csv", "text/csv; charset=utf-8"),
    ("xml", "text/xml; charset=utf-8"),
    ("svg", "image/svg+xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("ico", "image/x-icon"),
    ("bmp", "image/bmp"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
    ("otf", "font/otf"),
    ("mp3", "audio/mpeg"),
    ("ogg", "audio/ogg"),
    ("wav", "audio/wav"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("wasm", "application/wasm"),
];

pub fn content_type_for(path: &Path) -> Mime {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| EXTENSIONS.iter().find(|(known, _)| known.eq_ignore_ascii_case(ext)))
        .and_then(|(_, content_type)| content_type.parse().ok())
        .unwrap_or(mime::APPLICATION_OCTET_STREAM)
}
