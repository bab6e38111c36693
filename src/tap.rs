// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Tap
//!
//! Taps exchanges of a broker without disturbing their consumers. Each
//! connection cycle sets up a fresh tap topology, merges the tap consumers
//! and the close notifications of the session into one stream and runs the
//! message loop on it. The connector redials whenever the loop reports a lost
//! connection.

use crate::{
    channel::AmqpDialer,
    config::{ExchangeConfiguration, RedialConfig, TapConfiguration, TapOptions},
    connector::{AmqpConnector, ReconnectAction, Worker, WorkerResult},
    errors::AmqpError,
    fanin::fanin,
    message_loop::{
        ConstantPredicate, LimitPredicate, MessageLoop, MessagePredicate, MessageSink, TapEvent,
    },
    redial::{Dialer, Redialer},
    session::Session,
    topology::TapTopology,
};
use async_trait::async_trait;
use futures_util::{future::join_all, stream::BoxStream, StreamExt};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// The worker tapping a set of exchanges on one broker.
///
/// Owns the names of the tap exchanges and queues it created, so that they
/// can be removed when tapping ends or after a reconnect.
pub struct AmqpTap {
    exchanges: Vec<ExchangeConfiguration>,
    topology: TapTopology,
    message_loop: MessageLoop,
    sink: Arc<dyn MessageSink>,
    err_sink: mpsc::UnboundedSender<AmqpError>,
}

impl AmqpTap {
    pub fn new(
        exchanges: Vec<ExchangeConfiguration>,
        message_loop: MessageLoop,
        sink: Arc<dyn MessageSink>,
        err_sink: mpsc::UnboundedSender<AmqpError>,
    ) -> Self {
        AmqpTap {
            exchanges,
            topology: TapTopology::new(),
            message_loop,
            sink,
            err_sink,
        }
    }

    pub fn topology(&self) -> &TapTopology {
        &self.topology
    }

    pub fn message_loop(&self) -> &MessageLoop {
        &self.message_loop
    }
}

#[async_trait]
impl<S: Session> Worker<S> for AmqpTap {
    async fn run(&mut self, token: &CancellationToken, session: &S) -> WorkerResult {
        // exchanges of a lost connection are not auto-deleted
        self.topology.remove_leftovers(session).await;

        let streams = match self
            .topology
            .setup_taps_for_exchanges(session, &self.exchanges)
            .await
        {
            Ok(streams) => streams,
            Err(err) => {
                error!(error = err.to_string(), "failure to set up tap");
                self.topology.remove_taps(session).await;
                return (ReconnectAction::DoNotReconnect, Err(err));
            }
        };

        let mut inputs: Vec<BoxStream<'static, TapEvent>> =
            vec![session.notify_close().map(TapEvent::Closed).boxed()];
        inputs.extend(streams.into_iter().map(|stream| {
            stream
                .map(|item| match item {
                    Ok(delivery) => TapEvent::Delivery(delivery),
                    Err(err) => TapEvent::Closed(err),
                })
                .boxed()
        }));

        let cycle = token.child_token();
        let mut events = fanin(cycle.clone(), inputs);
        let (action, result) = self
            .message_loop
            .run(token, self.sink.as_ref(), &self.err_sink, &mut events)
            .await;
        cycle.cancel();

        if !action.should_reconnect() {
            debug!("removing tap topology");
            self.topology.remove_taps(session).await;
        }

        (action, result)
    }
}

/// Builds the termination predicate for the configured message limit.
pub fn termination_from_options(options: &TapOptions) -> Arc<dyn MessagePredicate> {
    match options.limit {
        Some(limit) => Arc::new(LimitPredicate::new(limit)),
        None => Arc::new(ConstantPredicate(false)),
    }
}

/// Taps the exchanges of one broker until the tap ends.
///
/// Reconnects transparently after connection losses.
pub async fn establish_tap(
    token: &CancellationToken,
    config: &TapConfiguration,
    options: &TapOptions,
    filter: Arc<dyn MessagePredicate>,
    termination: Arc<dyn MessagePredicate>,
    sink: Arc<dyn MessageSink>,
    err_sink: mpsc::UnboundedSender<AmqpError>,
) -> Result<(), AmqpError> {
    let dialer = AmqpDialer::new(&config.amqp_url, &options.connection_name);
    let message_loop = MessageLoop::new(filter, termination, options.idle_timeout());
    let tap = AmqpTap::new(config.exchanges.clone(), message_loop, sink, err_sink);

    establish_tap_with(token, dialer, &options.redial, tap).await
}

/// Runs a tap on the sessions of the given dialer.
///
/// # Parameters
/// * `token` - Stops the tap; its topology is removed before returning
/// * `dialer` - Opens the sessions, redialed as configured by `redial`
/// * `tap` - The worker run on every session
///
/// # Returns
/// `Ok` once the termination predicate, the idle timeout or the token ended
/// the tap, else the error that stopped it
pub async fn establish_tap_with<D: Dialer>(
    token: &CancellationToken,
    dialer: D,
    redial: &RedialConfig,
    mut tap: AmqpTap,
) -> Result<(), AmqpError> {
    let mut connector = AmqpConnector::new(Redialer::new(dialer, redial.clone()));

    connector.connect(token, &mut tap).await
}

/// Taps several brokers concurrently, one connector each.
///
/// The first tap to fail stops the others; its error is returned.
pub async fn tap_all(
    token: &CancellationToken,
    configs: &[TapConfiguration],
    options: &TapOptions,
    filter: Arc<dyn MessagePredicate>,
    sink: Arc<dyn MessageSink>,
    err_sink: mpsc::UnboundedSender<AmqpError>,
) -> Result<(), AmqpError> {
    let brokers = configs
        .iter()
        .map(|config| {
            let dialer = AmqpDialer::new(&config.amqp_url, &options.connection_name);
            (dialer, config.exchanges.clone())
        })
        .collect();

    tap_all_with(token, brokers, options, filter, sink, err_sink).await
}

/// Taps the exchanges of several brokers, each reached through its own dialer.
///
/// # Parameters
/// * `token` - Stops all taps
/// * `brokers` - A dialer per broker and the exchanges to tap there
/// * `options` - Termination, idle timeout and redial settings shared by all taps
///
/// # Returns
/// The error of the first tap that failed on its own. Taps ending because of
/// that failure, or because `token` was cancelled, do not count as failed.
pub async fn tap_all_with<D: Dialer>(
    token: &CancellationToken,
    brokers: Vec<(D, Vec<ExchangeConfiguration>)>,
    options: &TapOptions,
    filter: Arc<dyn MessagePredicate>,
    sink: Arc<dyn MessageSink>,
    err_sink: mpsc::UnboundedSender<AmqpError>,
) -> Result<(), AmqpError> {
    let group = token.child_token();
    let first_error = OnceLock::new();

    let taps = brokers.into_iter().map(|(dialer, exchanges)| {
        let group = group.clone();
        let first_error = &first_error;
        let message_loop = MessageLoop::new(
            filter.clone(),
            termination_from_options(options),
            options.idle_timeout(),
        );
        let tap = AmqpTap::new(exchanges, message_loop, sink.clone(), err_sink.clone());

        async move {
            let Err(err) = establish_tap_with(&group, dialer, &options.redial, tap).await else {
                return;
            };

            if group.is_cancelled() {
                debug!(error = err.to_string(), "tap stopped");
            } else {
                error!(error = err.to_string(), "tap failed, stopping all taps");
                let _ = first_error.set(err);
                group.cancel();
            }
        }
    });
    join_all(taps).await;

    match first_error.into_inner() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
