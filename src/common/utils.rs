//! Utility functions for volplane

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

/// Percent-encoding set for names embedded in KV keys (includes /, %, and control chars)
const KEY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&');

/// Encode a resource name for use as a KV key segment
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}

/// Decode a percent-encoded key segment
pub fn decode_key(encoded: &str) -> crate::Result<String> {
    percent_decode_str(encoded)
        .decode_utf8()
        .map(|s| s.to_string())
        .map_err(|e| crate::Error::BadRequest(format!("Failed to decode key: {}", e)))
}

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

/// Retry with exponential backoff.
///
/// Only used for filesystem formatting; array calls are never retried.
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: std::time::Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;
    let attempts = max_retries.max(1);

    for attempt in 0..attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < attempts - 1 => {
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

/// Validate a volume/share name (non-empty, reasonable length, printable)
pub fn validate_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::BadRequest("name cannot be empty".into()));
    }

    if name.len() > 255 {
        return Err(crate::Error::BadRequest(
            "name too long (max 255 bytes)".into(),
        ));
    }

    if name.chars().any(|c| c.is_control() || c == '/') {
        return Err(crate::Error::BadRequest(
            "name contains invalid characters".into(),
        ));
    }

    Ok(())
}

/// Parse an `uid:gid` ownership string
pub fn parse_owner(owner: &str) -> crate::Result<(u32, u32)> {
    let (uid, gid) = owner
        .split_once(':')
        .ok_or_else(|| crate::Error::BadRequest(format!("invalid owner '{}'", owner)))?;
    let uid = uid
        .parse()
        .map_err(|_| crate::Error::BadRequest(format!("invalid uid in '{}'", owner)))?;
    let gid = gid
        .parse()
        .map_err(|_| crate::Error::BadRequest(format!("invalid gid in '{}'", owner)))?;
    Ok((uid, gid))
}

/// Parse an octal file mode such as `0755`
pub fn parse_mode(mode: &str) -> crate::Result<u32> {
    u32::from_str_radix(mode.trim_start_matches("0o"), 8)
        .map_err(|_| crate::Error::BadRequest(format!("invalid mode '{}'", mode)))
}
