// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Redial
//!
//! Produces one fresh session per request, dialing again with capped
//! exponential backoff until a connection succeeds, the policy gives up or
//! the cancellation token fires.

use crate::{config::RedialConfig, errors::AmqpError, session::Session};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Something that can open a new session to the broker.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Session: Session;

    async fn dial(&self) -> Result<Self::Session, AmqpError>;
}

/// Yields sessions from a `Dialer`, retrying failed dials.
pub struct Redialer<D> {
    dialer: D,
    config: RedialConfig,
    connected: bool,
}

impl<D: Dialer> Redialer<D> {
    pub fn new(dialer: D, config: RedialConfig) -> Self {
        Redialer {
            dialer,
            config,
            connected: false,
        }
    }

    /// Waits for the next session.
    ///
    /// Returns `SessionFactoryClosed` when cancelled, when the first dial ever
    /// fails in fail-early mode, or when `max_attempts` consecutive dials failed.
    pub async fn next_session(
        &mut self,
        token: &CancellationToken,
    ) -> Result<D::Session, AmqpError> {
        let mut backoff = self.config.initial_backoff();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let result = tokio::select! {
                _ = token.cancelled() => {
                    return Err(AmqpError::SessionFactoryClosed("cancelled".to_owned()));
                }
                result = self.dialer.dial() => result,
            };

            let err = match result {
                Ok(session) => {
                    debug!(attempts, "session established");
                    self.connected = true;
                    return Ok(session);
                }
                Err(err) => err,
            };

            if self.config.fail_early && !self.connected {
                return Err(AmqpError::SessionFactoryClosed(err.to_string()));
            }

            if self.config.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(AmqpError::SessionFactoryClosed(format!(
                    "giving up after {attempts} attempts: {err}"
                )));
            }

            warn!(
                error = err.to_string(),
                attempts, "dial failed, retrying in {:?}", backoff
            );

            tokio::select! {
                _ = token.cancelled() => {
                    return Err(AmqpError::SessionFactoryClosed("cancelled".to_owned()));
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(self.config.max_backoff());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::session::MockSession;
    use std::{collections::VecDeque, sync::Mutex};

    /// Hands out pre-built dial results in order.
    pub(crate) struct ScriptedDialer {
        results: Mutex<VecDeque<Result<MockSession, AmqpError>>>,
    }

    impl ScriptedDialer {
        pub(crate) fn new(results: Vec<Result<MockSession, AmqpError>>) -> Self {
            ScriptedDialer {
                results: Mutex::new(results.into()),
            }
        }

        pub(crate) fn remaining(&self) -> usize {
            self.results.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        type Session = MockSession;

        async fn dial(&self) -> Result<MockSession, AmqpError> {
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AmqpError::ConnectionError("no more sessions".to_owned())))
        }
    }

    fn refused() -> Result<MockSession, AmqpError> {
        Err(AmqpError::ConnectionError("connection refused".to_owned()))
    }

    #[tokio::test]
    async fn should_fail_early_when_first_dial_fails() {
        let mut redialer = Redialer::new(
            ScriptedDialer::new(vec![refused(), Ok(MockSession::new())]),
            RedialConfig::default(),
        );

        let err = redialer
            .next_session(&CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AmqpError::SessionFactoryClosed("failure to connect: connection refused".to_owned())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn should_retry_with_backoff_until_dial_succeeds() {
        let dialer = ScriptedDialer::new(vec![refused(), refused(), Ok(MockSession::new())]);
        let config = RedialConfig {
            fail_early: false,
            ..Default::default()
        };
        let mut redialer = Redialer::new(dialer, config);

        assert!(redialer.next_session(&CancellationToken::new()).await.is_ok());
        assert_eq!(redialer.dialer.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_keep_retrying_after_a_first_success_in_fail_early_mode() {
        let dialer = ScriptedDialer::new(vec![
            Ok(MockSession::new()),
            refused(),
            Ok(MockSession::new()),
        ]);
        let mut redialer = Redialer::new(dialer, RedialConfig::default());
        let token = CancellationToken::new();

        assert!(redialer.next_session(&token).await.is_ok());
        assert!(redialer.next_session(&token).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn should_give_up_after_max_attempts() {
        let config = RedialConfig {
            fail_early: false,
            max_attempts: Some(2),
            ..Default::default()
        };
        let mut redialer = Redialer::new(
            ScriptedDialer::new(vec![refused(), refused(), Ok(MockSession::new())]),
            config,
        );

        let err = redialer
            .next_session(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::SessionFactoryClosed(_)));
        assert_eq!(redialer.dialer.remaining(), 1);
    }

    #[tokio::test]
    async fn should_stop_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let mut redialer = Redialer::new(
            ScriptedDialer::new(vec![refused()]),
            RedialConfig {
                fail_early: false,
                ..Default::default()
            },
        );

        let err = redialer.next_session(&token).await.unwrap_err();

        assert_eq!(err, AmqpError::SessionFactoryClosed("cancelled".to_owned()));
    }
}
