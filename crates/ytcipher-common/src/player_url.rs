//! Player URL validation, normalization, and cache keying.
//!
//! Player scripts are only ever fetched from a small set of upstream hosts.
//! Clients may send either a full URL or a relative `/s/player/...` path,
//! which is rewritten onto the canonical `www` host before any other
//! processing. The normalized URL is what every downstream layer (cache
//! keying, fetching, metrics labels) operates on.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::CipherError;

/// Hosts a player script may be fetched from.
const ALLOWED_HOSTS: &[&str] = &["youtube.com", "www.youtube.com", "m.youtube.com"];

/// Longest sanitized player id usable as a filename; anything longer falls
/// back to the digest key.
const MAX_ID_KEY_LEN: usize = 120;

static PLAYER_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/s/player/([^/]+)/").expect("constant regex pattern is valid")
});

/// Cache key derivation mode for player files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyMode {
    /// Key on the full URL: players served per-region cache separately.
    RegionAware,
    /// Key on the player id alone, collapsing regional variants.
    RegionIgnoring,
}

/// Validates a raw player URL and rewrites it into canonical form.
///
/// Accepts absolute `https` URLs on an allowed host, or a relative path
/// beginning with `/s/player/` (rewritten to the `www` host).
///
/// # Errors
///
/// Returns `CipherError::Validation` for any other input.
pub fn normalize_player_url(raw: &str) -> Result<String, CipherError> {
    if raw.starts_with("/s/player/") {
        return Ok(format!("https://www.youtube.com{raw}"));
    }

    let parsed = Url::parse(raw)
        .map_err(|e| CipherError::Validation(format!("invalid player_url: {e}")))?;

    if parsed.scheme() != "https" {
        return Err(CipherError::Validation(format!(
            "player_url must use https, got {}",
            parsed.scheme()
        )));
    }

    match parsed.host_str() {
        Some(host) if ALLOWED_HOSTS.contains(&host) => Ok(parsed.into()),
        Some(host) => Err(CipherError::Validation(format!(
            "player_url host not allowed: {host}"
        ))),
        None => Err(CipherError::Validation(
            "player_url has no host".to_string(),
        )),
    }
}

/// Extracts the player id from a normalized player URL.
///
/// Returns `None` when the URL does not match the `/s/player/<id>/` shape.
pub fn extract_player_id(url: &str) -> Option<&str> {
    PLAYER_ID_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Player id suitable for a metrics label: the extracted id or `"unknown"`.
pub fn player_id_label(url: &str) -> &str {
    extract_player_id(url).unwrap_or("unknown")
}

/// Derives the on-disk cache key for a player URL.
///
/// Region-aware keys are the lowercase hex SHA-256 of the full URL, so the
/// same player served from different regional endpoints caches separately.
/// Region-ignoring keys use the sanitized player id, falling back to the
/// digest when extraction fails or the sanitized id is unreasonably long.
pub fn cache_key(url: &str, mode: KeyMode) -> String {
    match mode {
        KeyMode::RegionAware => sha256_hex(url),
        KeyMode::RegionIgnoring => match extract_player_id(url) {
            Some(id) => {
                let sanitized = sanitize_id(id);
                if sanitized.len() > MAX_ID_KEY_LEN {
                    sha256_hex(url)
                } else {
                    sanitized
                }
            }
            None => sha256_hex(url),
        },
    }
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
