//! Bounded exponential-backoff reconnection for ComfyUI WebSocket
//! connections.
//!
//! When the push channel drops in the middle of a job, the listener
//! calls [`reconnect_loop`] to retry with increasing delays until the
//! connection is restored, the attempt budget is spent, or the
//! [`CancellationToken`] is triggered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};

/// Default number of reconnect attempts over the life of a push channel.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Attempts before giving up on the push channel.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Attempt to reconnect to a ComfyUI instance with exponential backoff.
///
/// The budget of [`ReconnectConfig::max_attempts`] is shared by every
/// drop of one push channel: `attempts_used` is how much of it earlier
/// reconnects already spent. `on_attempt` is invoked with the 1-based
/// attempt number before each try. Returns `Some(connection)` once a
/// connection succeeds, or `None` if the budget runs out or `cancel` is
/// triggered first.
pub async fn reconnect_loop(
    client: &ComfyUIClient,
    client_id: &str,
    config: &ReconnectConfig,
    attempts_used: u32,
    cancel: &CancellationToken,
    mut on_attempt: impl FnMut(u32),
) -> Option<ComfyUIConnection> {
    let mut delay = config.initial_delay;

    for attempt in attempts_used.saturating_add(1)..=config.max_attempts {
        on_attempt(attempt);
        tracing::info!(
            client_id,
            attempt,
            max_attempts = config.max_attempts,
            "Reconnecting to ComfyUI",
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(client_id, "Reconnect cancelled");
                return None;
            }
            result = client.connect(client_id) => {
                match result {
                    Ok(conn) => {
                        tracing::info!(client_id, attempt, "Reconnected to ComfyUI");
                        return Some(conn);
                    }
                    Err(e) => {
                        tracing::warn!(
                            client_id,
                            error = %e,
                            "Reconnect attempt {attempt} failed",
                        );
                    }
                }
            }
        }

        if attempt == config.max_attempts {
            break;
        }

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, config);
    }

    tracing::warn!(
        client_id,
        attempts = config.max_attempts,
        "Giving up on ComfyUI push channel",
    );
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_doubles() {
        let config = ReconnectConfig::default();
        let d = next_delay(Duration::from_secs(1), &config);
        assert_eq!(d, Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let config = ReconnectConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(8), &config);
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn custom_multiplier() {
        let config = ReconnectConfig {
            multiplier: 3.0,
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(2), &config);
        assert_eq!(d, Duration::from_secs(6));
    }

    #[tokio::test]
    async fn cancellation_token_stops_reconnect() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let client = ComfyUIClient::new("ws://127.0.0.1:1");
        let config = ReconnectConfig::default();

        let result = reconnect_loop(&client, "c1", &config, 0, &cancel, |_| {}).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let cancel = CancellationToken::new();
        let client = ComfyUIClient::new("ws://127.0.0.1:1");
        let config = ReconnectConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        };

        let mut seen = Vec::new();
        let result = reconnect_loop(&client, "c1", &config, 0, &cancel, |n| seen.push(n)).await;
        assert!(result.is_none());
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn continues_from_attempts_already_used() {
        let cancel = CancellationToken::new();
        let client = ComfyUIClient::new("ws://127.0.0.1:1");
        let config = ReconnectConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        };

        let mut seen = Vec::new();
        let result = reconnect_loop(&client, "c1", &config, 2, &cancel, |n| seen.push(n)).await;
        assert!(result.is_none());
        assert_eq!(seen, vec![3]);

        seen.clear();
        let result = reconnect_loop(&client, "c1", &config, 3, &cancel, |n| seen.push(n)).await;
        assert!(result.is_none());
        assert!(seen.is_empty());
    }
}
