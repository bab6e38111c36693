// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connector
//!
//! Keeps a long-lived worker connected to the broker. The connector dials a
//! session, lends it to the worker and, depending on the worker's
//! `ReconnectAction`, either dials again or closes the connection and returns
//! the worker's result.

use crate::{
    errors::AmqpError,
    redial::{Dialer, Redialer},
    session::Session,
};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Tells the connector what to do once a worker returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// The connection was lost, dial a new session and run the worker again.
    Reconnect,
    /// The worker is done, close the connection and return.
    DoNotReconnect,
}

impl ReconnectAction {
    pub fn should_reconnect(&self) -> bool {
        matches!(self, ReconnectAction::Reconnect)
    }
}

/// What a worker returns: the reconnect decision and the outcome of the cycle.
pub type WorkerResult = (ReconnectAction, Result<(), AmqpError>);

/// The work done with one established session.
///
/// A worker must return `DoNotReconnect` when it observes cancellation and
/// `Reconnect` on connection errors it wants retried.
#[async_trait]
pub trait Worker<S: Session>: Send {
    async fn run(&mut self, token: &CancellationToken, session: &S) -> WorkerResult;
}

/// Manages the connection to the broker and reconnects after connection losses.
pub struct AmqpConnector<D> {
    redialer: Redialer<D>,
}

impl<D: Dialer> AmqpConnector<D> {
    pub fn new(redialer: Redialer<D>) -> Self {
        AmqpConnector { redialer }
    }

    /// Runs the worker on fresh sessions until it returns `DoNotReconnect`.
    ///
    /// Before redialing, the connection of the abandoned session is closed
    /// best effort, since a channel-level failure leaves it open. On the
    /// `DoNotReconnect` exit path the connection is closed once and the
    /// worker's result is returned; a failing close is reported only when the
    /// worker itself succeeded.
    ///
    /// # Parameters
    /// * `token` - Cancels dialing and is handed to the worker
    /// * `worker` - The work to run on every session
    ///
    /// # Returns
    /// The worker's final result, or `SessionFactoryClosed` if no session can
    /// be obtained anymore
    pub async fn connect<W>(
        &mut self,
        token: &CancellationToken,
        worker: &mut W,
    ) -> Result<(), AmqpError>
    where
        W: Worker<D::Session> + ?Sized,
    {
        loop {
            debug!("waiting for new session");
            let session = self.redialer.next_session(token).await?;
            debug!("got new amqp session ...");

            let (action, result) = worker.run(token, &session).await;

            if action.should_reconnect() {
                match &result {
                    Err(err) if err.is_connection_error() => {
                        warn!(error = err.to_string(), "connection lost, reconnecting")
                    }
                    Err(err) => error!(error = err.to_string(), "worker failed, reconnecting"),
                    Ok(()) => debug!("worker asked for a new session"),
                }
                if let Err(err) = session.close().await {
                    debug!(error = err.to_string(), "closing abandoned connection failed");
                }
                continue;
            }

            return match (result, session.close().await) {
                (result, Ok(())) => result,
                (Ok(()), Err(close_err)) => {
                    error!(error = close_err.to_string(), "connection close failed");
                    Err(close_err)
                }
                (Err(err), Err(close_err)) => {
                    error!(error = close_err.to_string(), "connection close failed");
                    Err(err)
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RedialConfig, redial::tests::ScriptedDialer, session::MockSession};
    use std::collections::VecDeque;

    struct ScriptedWorker {
        results: VecDeque<WorkerResult>,
        runs: usize,
    }

    impl ScriptedWorker {
        fn new(results: Vec<WorkerResult>) -> Self {
            ScriptedWorker {
                results: results.into(),
                runs: 0,
            }
        }
    }

    #[async_trait]
    impl Worker<MockSession> for ScriptedWorker {
        async fn run(
            &mut self,
            _token: &CancellationToken,
            _session: &MockSession,
        ) -> WorkerResult {
            self.runs += 1;
            self.results
                .pop_front()
                .unwrap_or((ReconnectAction::DoNotReconnect, Err(AmqpError::InternalError)))
        }
    }

    fn session_closed(times: usize) -> MockSession {
        let mut session = MockSession::new();
        session.expect_close().times(times).returning(|| Ok(()));
        session
    }

    fn connector(sessions: Vec<Result<MockSession, AmqpError>>) -> AmqpConnector<ScriptedDialer> {
        AmqpConnector::new(Redialer::new(
            ScriptedDialer::new(sessions),
            RedialConfig::default(),
        ))
    }

    #[tokio::test]
    async fn should_close_connection_once_on_clean_shutdown() {
        let mut connector = connector(vec![Ok(session_closed(1))]);
        let mut worker = ScriptedWorker::new(vec![(ReconnectAction::DoNotReconnect, Ok(()))]);

        let result = connector.connect(&CancellationToken::new(), &mut worker).await;

        assert_eq!(result, Ok(()));
        assert_eq!(worker.runs, 1);
    }

    #[tokio::test]
    async fn should_close_abandoned_session_and_redial() {
        let mut connector = connector(vec![Ok(session_closed(1)), Ok(session_closed(1))]);
        let mut worker = ScriptedWorker::new(vec![
            (
                ReconnectAction::Reconnect,
                Err(AmqpError::ConnectionLost("channel closed".to_owned())),
            ),
            (ReconnectAction::DoNotReconnect, Ok(())),
        ]);

        let result = connector.connect(&CancellationToken::new(), &mut worker).await;

        assert_eq!(result, Ok(()));
        assert_eq!(worker.runs, 2);
    }

    #[tokio::test]
    async fn should_redial_even_if_abandoned_connection_fails_to_close() {
        let mut abandoned = MockSession::new();
        abandoned
            .expect_close()
            .times(1)
            .returning(|| Err(AmqpError::CloseConnectionError("already closed".to_owned())));
        let mut connector = connector(vec![Ok(abandoned), Ok(session_closed(1))]);
        let mut worker = ScriptedWorker::new(vec![
            (
                ReconnectAction::Reconnect,
                Err(AmqpError::ConsumerError("consumer cancelled".to_owned())),
            ),
            (ReconnectAction::DoNotReconnect, Ok(())),
        ]);

        let result = connector.connect(&CancellationToken::new(), &mut worker).await;

        assert_eq!(result, Ok(()));
        assert_eq!(worker.runs, 2);
    }

    #[tokio::test]
    async fn should_return_worker_error_when_not_reconnecting() {
        let mut connector = connector(vec![Ok(session_closed(1))]);
        let mut worker = ScriptedWorker::new(vec![(
            ReconnectAction::DoNotReconnect,
            Err(AmqpError::SinkError("disk full".to_owned())),
        )]);

        let result = connector.connect(&CancellationToken::new(), &mut worker).await;

        assert_eq!(result, Err(AmqpError::SinkError("disk full".to_owned())));
    }

    #[tokio::test]
    async fn should_not_mask_worker_error_with_close_error() {
        let mut session = MockSession::new();
        session
            .expect_close()
            .times(1)
            .returning(|| Err(AmqpError::CloseConnectionError("gone".to_owned())));
        let mut connector = connector(vec![Ok(session)]);
        let mut worker = ScriptedWorker::new(vec![(
            ReconnectAction::DoNotReconnect,
            Err(AmqpError::SinkError("disk full".to_owned())),
        )]);

        let result = connector.connect(&CancellationToken::new(), &mut worker).await;

        assert_eq!(result, Err(AmqpError::SinkError("disk full".to_owned())));
    }

    #[tokio::test]
    async fn should_report_close_error_after_clean_shutdown() {
        let mut session = MockSession::new();
        session
            .expect_close()
            .times(1)
            .returning(|| Err(AmqpError::CloseConnectionError("gone".to_owned())));
        let mut connector = connector(vec![Ok(session)]);
        let mut worker = ScriptedWorker::new(vec![(ReconnectAction::DoNotReconnect, Ok(()))]);

        let result = connector.connect(&CancellationToken::new(), &mut worker).await;

        assert_eq!(result, Err(AmqpError::CloseConnectionError("gone".to_owned())));
    }

    #[tokio::test]
    async fn should_fail_when_session_factory_closes() {
        let mut connector = connector(vec![Err(AmqpError::ConnectionError("refused".to_owned()))]);
        let mut worker = ScriptedWorker::new(vec![]);

        let result = connector.connect(&CancellationToken::new(), &mut worker).await;

        assert!(matches!(result, Err(AmqpError::SessionFactoryClosed(_))));
        assert_eq!(worker.runs, 0);
    }
}
