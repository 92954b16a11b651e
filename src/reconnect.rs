//! Exponential-backoff reconnect loop (§4.7).
//!
//! Grounded on `tunnel::mod::run`'s outer loop (match the
//! inner connection's outcome, compute the next delay, loop) and the
//! jitter/doubling arithmetic in `registration::client::send_with_retry`.
//! Generalized from "retry one HTTP call" to "tear down and rebuild an
//! entire session", and from a fixed cap to a configurable
//! initial/max/attempts triple.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{AuthError, ClientError, SessionError};
use crate::events::{ClientEvent, EventEmitter};

const BACKOFF_CAP: Duration = Duration::from_secs(120);
const JITTER_LOW: f64 = 0.8;
const JITTER_HIGH: f64 = 1.2;

/// Narrow collaborator the embedding application implements to recover
/// from an expired auth token without the reconnect loop knowing
/// anything about how tokens are minted.
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, server_addr: &str) -> Result<String, RefreshError>;
}

#[derive(Debug, thiserror::Error)]
#[error("token refresh failed: {0}")]
pub struct RefreshError(pub String);

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    /// 0 means unbounded.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: BACKOFF_CAP,
            max_attempts: 0,
        }
    }
}

/// Coalesces concurrent reconnect triggers (control-reader, stream
/// acceptor, and keepalive can all notice a dead session at once) to a
/// single running loop, mirroring a mutex-guarded
/// `reconnecting` flag.
#[derive(Clone, Default)]
pub struct ReconnectGuard {
    reconnecting: Arc<AtomicBool>,
}

impl ReconnectGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call won the race and should drive the
    /// loop; a concurrent caller that loses gets `false` and should do
    /// nothing (another instance is already reconnecting).
    pub fn try_begin(&self) -> bool {
        self.reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn finish(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
    }
}

fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(JITTER_LOW..=JITTER_HIGH);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Drive reconnect attempts by invoking `connect` until it succeeds,
/// `max_attempts` is exhausted, or a `TokenExpired` error occurs with no
/// refresher configured. `connect` is expected to perform its own
/// teardown of any prior session state before attempting a fresh one
/// (steps 1-3 of §4.7 are the caller's responsibility, since only it
/// holds the session handles).
pub async fn run<F, Fut>(
    config: BackoffConfig,
    token_refresher: Option<Arc<dyn TokenRefresher>>,
    server_addr: &str,
    stored_token: &mut String,
    events: &EventEmitter,
    mut connect: F,
) -> Result<(), ClientError>
where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = Result<(), SessionError>>,
{
    let mut delay = config.initial;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        if config.max_attempts > 0 && attempt > config.max_attempts {
            return Err(ClientError::MaxAttemptsExceeded(config.max_attempts));
        }
        events.emit(ClientEvent::Reconnecting { attempt, delay });

        match connect(stored_token.clone()).await {
            Ok(()) => {
                events.emit(ClientEvent::Connected);
                delay = config.initial;
                return Ok(());
            }
            Err(SessionError::Auth(AuthError::TokenExpired)) => {
                match &token_refresher {
                    Some(refresher) => match refresher.refresh(server_addr).await {
                        Ok(new_token) => {
                            *stored_token = new_token;
                            tracing::info!("token refreshed, retrying without delay");
                            continue;
                        }
                        Err(error) => {
                            tracing::warn!(%error, "token refresh failed");
                            sleep_and_double(&mut delay, config.max).await;
                        }
                    },
                    None => {
                        events.emit(ClientEvent::Disconnected {
                            reason: Some("auth token expired, no refresher configured".into()),
                        });
                        return Err(ClientError::ShutdownNoRefresher);
                    }
                }
            }
            Err(error) => {
                tracing::warn!(%error, "connect attempt failed");
                events.emit(ClientEvent::Disconnected {
                    reason: Some(error.to_string()),
                });
                sleep_and_double(&mut delay, config.max).await;
            }
        }
    }
}

async fn sleep_and_double(delay: &mut Duration, max: Duration) {
    tokio::time::sleep(jittered(*delay)).await;
    *delay = (*delay * 2).min(max);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct AlwaysRefreshes;

    #[async_trait::async_trait]
    impl TokenRefresher for AlwaysRefreshes {
        async fn refresh(&self, _server_addr: &str) -> Result<String, RefreshError> {
            Ok("fresh-token".into())
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_sleeping() {
        let events = EventEmitter::new();
        let mut token = "tok".to_string();
        let config = BackoffConfig {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(60),
            max_attempts: 0,
        };
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            run(config, None, "server", &mut token, &events, |_| async {
                Ok(())
            }),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn token_refresh_retries_without_sleeping() {
        let events = EventEmitter::new();
        let mut token = "stale".to_string();
        let attempts = Arc::new(AtomicU32::new(0));
        let config = BackoffConfig {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(60),
            max_attempts: 0,
        };
        let attempts2 = attempts.clone();
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            run(
                config,
                Some(Arc::new(AlwaysRefreshes)),
                "server",
                &mut token,
                &events,
                move |tok| {
                    let attempts = attempts2.clone();
                    async move {
                        let n = attempts.fetch_add(1, Ordering::SeqCst);
                        if n == 0 {
                            assert_eq!(tok, "stale");
                            Err(SessionError::Auth(AuthError::TokenExpired))
                        } else {
                            assert_eq!(tok, "fresh-token");
                            Ok(())
                        }
                    }
                },
            ),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
        assert_eq!(token, "fresh-token");
    }

    #[tokio::test]
    async fn shuts_down_on_token_expiry_with_no_refresher() {
        let events = EventEmitter::new();
        let mut token = "stale".to_string();
        let config = BackoffConfig::default();
        let result = run(config, None, "server", &mut token, &events, |_| async {
            Err(SessionError::Auth(AuthError::TokenExpired))
        })
        .await;
        assert!(matches!(result, Err(ClientError::ShutdownNoRefresher)));
    }

    #[tokio::test]
    async fn max_attempts_is_enforced() {
        let events = EventEmitter::new();
        let mut token = "tok".to_string();
        let config = BackoffConfig {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            max_attempts: 2,
        };
        let result = run(config, None, "server", &mut token, &events, |_| async {
            Err(SessionError::Disconnected)
        })
        .await;
        assert!(matches!(result, Err(ClientError::MaxAttemptsExceeded(2))));
    }

    #[test]
    fn reconnect_guard_only_lets_one_caller_begin() {
        let guard = ReconnectGuard::new();
        assert!(guard.try_begin());
        assert!(!guard.try_begin());
        guard.finish();
        assert!(guard.try_begin());
    }
}
