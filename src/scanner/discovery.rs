use std::path::Path;

use crate::config::DiscoveryConfig;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "avi", "mkv", "webm", "3gp"];

/// Image types the decoder cannot read. Left out of the media set so they
/// never reach a worker.
const UNDECODABLE_IMAGES: &[&str] = &[
    "image/heic",
    "image/heif",
    "image/heic-sequence",
    "image/heif-sequence",
    "image/svg+xml",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// Best-effort MIME type from a file extension.
pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext.to_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "webp" => "image/webp",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "3gp" => "video/3gpp",
        _ => return None,
    };
    Some(mime)
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(mime_for_extension)
}

fn is_generic(mime: &str) -> bool {
    matches!(
        mime,
        "" | "application/octet-stream" | "binary/octet-stream" | "application/unknown"
    )
}

/// Decide whether a file belongs to the media set, returning its kind and
/// the MIME type to record. The reported MIME type wins unless it is
/// missing or generic, in which case the extension decides.
pub fn classify(name: &str, mime_type: Option<&str>, config: &DiscoveryConfig) -> Option<(MediaKind, String)> {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    let reported = mime_type.map(|m| m.trim().to_lowercase()).filter(|m| !is_generic(m));
    let mime = match reported {
        Some(m) => m,
        None => {
            if config.image_extensions.iter().any(|e| e.to_lowercase() == ext) {
                mime_for_extension(&ext)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("image/{}", ext))
            } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
                mime_for_extension(&ext)?.to_string()
            } else {
                return None;
            }
        }
    };

    if UNDECODABLE_IMAGES.contains(&mime.as_str()) {
        tracing::debug!(name, mime = %mime, "Skipping image type the decoder cannot read");
        None
    } else if mime.starts_with("image/") {
        Some((MediaKind::Image, mime))
    } else if mime.starts_with("video/") && config.include_video {
        Some((MediaKind::Video, mime))
    } else {
        None
    }
}
