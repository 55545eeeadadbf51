//! Download configuration constants

use std::time::Duration;

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1000; // 1 second

/// Maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30000; // 30 seconds

/// Directory under the assets root holding partially written files.
pub const STAGING_DIR: &str = ".staging";

/// Extension used when the asset URL does not reveal one.
pub const DEFAULT_EXTENSION: &str = "jpg";

/// Upper bound on a single asset body (64 MiB).
pub const MAX_ASSET_BYTES: u64 = 64 * 1024 * 1024;

/// Calculate exponential backoff delay
pub fn calculate_backoff(retry_count: u32) -> Duration {
    let delay_ms = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(retry_count));
    let delay_ms = delay_ms.min(MAX_BACKOFF_MS);
    Duration::from_millis(delay_ms)
}

/// File extension for an asset URL, ignoring query and fragment.
pub fn extension_for(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext
        }
        _ => DEFAULT_EXTENSION,
    }
}
