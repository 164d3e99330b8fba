//! Exponential backoff for polling a prompt's history.
//!
//! When the WebSocket to a ComfyUI instance drops while a prompt is in
//! flight, the caller falls back to [`poll_history`], which keeps asking
//! `GET /history/{prompt_id}` with increasing delays until the prompt
//! shows up as finished or the [`CancellationToken`] is triggered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::history::{parse_history, PromptOutcome};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each attempt.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`BackoffConfig::max_delay`].
pub fn next_delay(current: Duration, config: &BackoffConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Poll a prompt's history until it reports an outcome.
///
/// Returns `Ok(None)` if `cancel` fires first. Transient request
/// failures are logged and retried; a connect failure or a non-2xx
/// response is returned to the caller.
pub async fn poll_history(
    api: &ComfyUIApi,
    prompt_id: &str,
    config: &BackoffConfig,
    cancel: &CancellationToken,
) -> Result<Option<PromptOutcome>, ComfyUIApiError> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(prompt_id, "History polling cancelled");
                return Ok(None);
            }
            result = api.get_history(prompt_id) => {
                match result {
                    Ok(history) => {
                        if let Some(outcome) = parse_history(&history, prompt_id) {
                            tracing::debug!(prompt_id, attempt, "Prompt finished according to history");
                            return Ok(Some(outcome));
                        }
                    }
                    Err(e) if e.is_connect() || matches!(e, ComfyUIApiError::ApiError { .. }) => {
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!(prompt_id, error = %e, "History poll attempt {attempt} failed");
                    }
                }
            }
        }

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_doubles() {
        let config = BackoffConfig::default();
        let d = next_delay(Duration::from_secs(1), &config);
        assert_eq!(d, Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let config = BackoffConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(8), &config);
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn custom_multiplier() {
        let config = BackoffConfig {
            multiplier: 3.0,
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(2), &config);
        assert_eq!(d, Duration::from_secs(6));
    }

    #[test]
    fn full_backoff_sequence() {
        let config = BackoffConfig::default();
        let mut delay = config.initial_delay;
        let expected = [500, 1000, 2000, 4000, 5000, 5000];

        for &expected_ms in &expected {
            assert_eq!(delay.as_millis() as u64, expected_ms);
            delay = next_delay(delay, &config);
        }
    }

    #[tokio::test]
    async fn cancellation_token_stops_polling() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let api = ComfyUIApi::new("http://localhost:9".into());
        let result = poll_history(&api, "p1", &BackoffConfig::default(), &cancel).await;
        assert!(matches!(result, Ok(None)));
    }
}
