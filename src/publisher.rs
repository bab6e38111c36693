// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Message Publisher
//!
//! Drains the publish channel fed by the replay engine and publishes every
//! message on the current session. A failed publish hands control back to the
//! connector; the message is kept and published first on the next session.

use crate::{
    channel::AmqpDialer,
    config::ReplayConfig,
    connector::{AmqpConnector, ReconnectAction, Worker, WorkerResult},
    errors::AmqpError,
    message::PublishMessage,
    redial::{Dialer, Redialer},
    replay::{publish_message_stream, MessageSource, ReplayDelayer},
    session::Session,
};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Capacity of the channel between the replay engine and the publisher.
pub const PUBLISH_CAPACITY: usize = 16;

/// Publishes the messages received on a channel until it is closed.
pub struct PublishWorker {
    rx: mpsc::Receiver<PublishMessage>,
    pending: Option<PublishMessage>,
    published: u64,
}

impl PublishWorker {
    pub fn new(rx: mpsc::Receiver<PublishMessage>) -> Self {
        PublishWorker {
            rx,
            pending: None,
            published: 0,
        }
    }

    /// Number of messages published so far.
    pub fn published(&self) -> u64 {
        self.published
    }

    async fn next(&mut self, token: &CancellationToken) -> Option<PublishMessage> {
        if let Some(message) = self.pending.take() {
            return Some(message);
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            message = self.rx.recv() => message,
        }
    }
}

#[async_trait]
impl<S: Session> Worker<S> for PublishWorker {
    async fn run(&mut self, token: &CancellationToken, session: &S) -> WorkerResult {
        while let Some(message) = self.next(token).await {
            if let Err(err) = session.publish(&message.routing, &message.publishing).await {
                error!(
                    error = err.to_string(),
                    exchange = message.routing.exchange(),
                    "publish failed, keeping message for next session"
                );
                self.pending = Some(message);
                return (ReconnectAction::Reconnect, Err(err));
            }
            self.published += 1;
        }

        debug!(published = self.published, "publisher done");
        (ReconnectAction::DoNotReconnect, Ok(()))
    }
}

/// Replays messages through the given connector.
///
/// The replay engine and the publisher run concurrently; the replay is
/// paced by the captured timestamps and by the publisher's backpressure.
/// Once the publisher's connector returns, a replay still waiting on a full
/// channel or on a delay is stopped.
///
/// # Parameters
/// * `token` - Cancels the replay; a cancelled replay ends with `Ok` unless
///   the source failed
/// * `connector` - Provides the sessions to publish on
/// * `config` - Routing overrides and pacing
/// * `source` - The messages to replay
///
/// # Returns
/// The replay's error, else the publisher's error, else `Ok`
pub async fn replay_with<D, S>(
    token: &CancellationToken,
    connector: &mut AmqpConnector<D>,
    config: &ReplayConfig,
    source: &mut S,
) -> Result<(), AmqpError>
where
    D: Dialer,
    S: MessageSource + ?Sized,
{
    config.validate()?;

    let replay_token = token.child_token();
    let (tx, rx) = mpsc::channel(PUBLISH_CAPACITY);
    let mut worker = PublishWorker::new(rx);
    let delayer = ReplayDelayer::new(config.speed, config.fixed_delay(), replay_token.clone());

    let replay = async {
        tokio::select! {
            result = publish_message_stream(
                tx,
                config.exchange.as_deref(),
                config.routing_key.as_deref(),
                &config.headers,
                source,
                &delayer,
            ) => result,
            _ = replay_token.cancelled() => Err(AmqpError::PublishChannelClosed),
        }
    };
    let publish = async {
        let result = connector.connect(token, &mut worker).await;
        replay_token.cancel();
        result
    };
    let (replayed, published) = tokio::join!(replay, publish);

    if token.is_cancelled() {
        debug!("replay cancelled");
        return match replayed {
            Err(AmqpError::PublishChannelClosed) => Ok(()),
            replayed => replayed,
        };
    }

    match (replayed, published) {
        // the publisher gave up first, its error is the cause
        (Err(AmqpError::PublishChannelClosed), Err(err)) => Err(err),
        (replayed, published) => replayed.and(published),
    }
}

/// Replays messages to the broker configured in `config`.
pub async fn replay_to_broker<S>(
    token: &CancellationToken,
    config: &ReplayConfig,
    source: &mut S,
) -> Result<(), AmqpError>
where
    S: MessageSource + ?Sized,
{
    let dialer = AmqpDialer::new(&config.amqp_url, &config.connection_name);
    let mut connector = AmqpConnector::new(Redialer::new(dialer, config.redial.clone()));

    replay_with(token, &mut connector, config, source).await
}
