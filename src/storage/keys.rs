//! Asset key derivation and the reverse mapping from a published URL back to its key.

use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::store::models::JobKind;

/// All generated assets live under this prefix.
pub const ASSET_PREFIX: &str = "assets/";

/// Maps a content type to a file extension, falling back to `bin`.
#[must_use]
pub fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        _ => "bin",
    }
}

fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// `assets/<owner>/<job>/<stage>.<ext>`
#[must_use]
pub fn asset_key(owner_id: &str, job_id: Uuid, kind: JobKind, content_type: &str) -> String {
    format!(
        "{ASSET_PREFIX}{}/{job_id}/{}.{}",
        sanitize_segment(owner_id),
        kind.as_ref(),
        extension_for(content_type)
    )
}

/// `<publicBase>/<bucket>/<key>`
#[must_use]
pub fn public_url(public_base: &str, bucket: &str, key: &str) -> String {
    format!("{}/{bucket}/{key}", public_base.trim_end_matches('/'))
}

/// Recovers the asset key from a URL published by [`public_url`].
///
/// The path's leading bucket segment is stripped when present; anything that does not land
/// under [`ASSET_PREFIX`] yields `None`. Bare keys are accepted as-is unless empty past the prefix.
#[must_use]
pub fn extract_key_from_url(raw: &str, bucket: &str) -> Option<String> {
    if raw.starts_with(ASSET_PREFIX) {
        return (raw.len() > ASSET_PREFIX.len()).then(|| raw.to_string());
    }

    let parsed = match Url::parse(raw) {
        Ok(url) => url,
        Err(error) => {
            warn!(url = raw, %error, "asset url could not be parsed");
            return None;
        }
    };

    let path = parsed.path().trim_start_matches('/');
    let bucket_prefix = format!("{bucket}/");
    let key = path.strip_prefix(&bucket_prefix).unwrap_or(path);

    if key.starts_with(ASSET_PREFIX) && key.len() > ASSET_PREFIX.len() {
        Some(key.to_string())
    } else {
        None
    }
}
