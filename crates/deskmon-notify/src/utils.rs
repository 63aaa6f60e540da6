//! Helpers shared by the channel implementations.

use crate::config::MAX_ATTEMPTS;
use crate::error::Result;
use deskmon_common::types::ChannelKind;
use std::future::Future;
use std::time::Duration;

/// Maximum length of a response body kept in an error message.
pub(crate) const MAX_BODY_LENGTH: usize = 512;

/// Truncates `s` to at most `max_len` bytes without splitting a character.
pub(crate) fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &s[..end])
}

/// Delay before retry number `attempt + 1`, capped at 30s.
fn backoff(attempt: u32) -> Duration {
    let millis = 100u64.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(millis.min(30_000))
}

/// Runs `op` up to `max_attempts` times with 100ms·2^n backoff between
/// attempts, returning the last error if every attempt fails.
pub(crate) async fn with_retries<F, Fut, T>(
    channel: ChannelKind,
    recipient: &str,
    max_attempts: u32,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = max_attempts.clamp(1, MAX_ATTEMPTS);
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < attempts => {
                tracing::warn!(
                    channel = %channel,
                    recipient,
                    attempt = attempt + 1,
                    error = %e,
                    "Notification attempt failed, retrying"
                );
                tokio::time::sleep(backoff(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
