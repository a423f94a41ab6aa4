use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::prompts::{REORDER_TOOL_NAME, TRANSLATE_TOOL_NAME};

pub(crate) const RATE_LIMIT_MAX_RETRIES: usize = 5;
pub(crate) const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(2);
pub(crate) const RATE_LIMIT_MAX_DELAY: Duration = Duration::from_secs(60);

pub(crate) fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    let code = status.as_u16();
    if code == 529 || code == 503 {
        return true;
    }
    let lower = body.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("resource_exhausted")
        || lower.contains("quota")
        || lower.contains("overloaded")
}

/// Whole seconds only; HTTP dates fall back to the local backoff.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    value.parse::<u64>().ok().map(Duration::from_secs)
}

/// Pipeline step a tool call belongs to, for log lines.
pub(crate) fn step_label(tool_name: &str) -> &str {
    match tool_name {
        REORDER_TOOL_NAME => "reading order",
        TRANSLATE_TOOL_NAME => "translation",
        other => other,
    }
}

/// Rate-limit state for one tool call against one provider.
#[derive(Debug)]
pub(crate) struct RateLimitBackoff<'a> {
    provider: &'static str,
    tool_name: &'a str,
    attempt: usize,
    delay: Duration,
}

impl<'a> RateLimitBackoff<'a> {
    pub(crate) fn new(provider: &'static str, tool_name: &'a str) -> Self {
        Self {
            provider,
            tool_name,
            attempt: 0,
            delay: RATE_LIMIT_BASE_DELAY,
        }
    }

    /// Counts one rejected request and returns how long to wait before the
    /// next one, or `None` once the retry budget is spent. A server
    /// `Retry-After` longer than the local delay wins, capped at
    /// [`RATE_LIMIT_MAX_DELAY`] so a page never stalls for minutes.
    pub(crate) fn next_wait(&mut self, retry_after: Option<Duration>) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= RATE_LIMIT_MAX_RETRIES {
            return None;
        }
        let wait = retry_after
            .filter(|server| *server > self.delay)
            .unwrap_or(self.delay)
            .min(RATE_LIMIT_MAX_DELAY);
        self.delay = next_delay(self.delay);
        Some(wait)
    }

    /// Sleeps through the next wait. Returns false when the caller should
    /// give up and surface the error.
    pub(crate) async fn pause(&mut self, retry_after: Option<Duration>) -> bool {
        let Some(wait) = self.next_wait(retry_after) else {
            warn!(
                "{} still rate limited during {} after {} attempts",
                self.provider,
                step_label(self.tool_name),
                self.attempt
            );
            return false;
        };
        warn!(
            "{} rate limited during {}; retrying in {:.1}s (attempt {}/{})",
            self.provider,
            step_label(self.tool_name),
            wait.as_secs_f32(),
            self.attempt,
            RATE_LIMIT_MAX_RETRIES
        );
        sleep(wait).await;
        true
    }
}

pub(crate) fn next_delay(current: Duration) -> Duration {
    let next_secs = current
        .as_secs()
        .saturating_mul(2)
        .max(RATE_LIMIT_BASE_DELAY.as_secs());
    Duration::from_secs(next_secs).min(RATE_LIMIT_MAX_DELAY)
}
