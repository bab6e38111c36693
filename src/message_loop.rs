// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Tap Message Loop
//!
//! Drains the merged delivery stream of one connection cycle. Deliveries pass
//! a filter predicate before they reach the message sink; a termination
//! predicate, an idle timeout or cancellation end the loop. A close signal
//! from the broker hands control back to the connector for a redial.

use crate::{
    connector::{ReconnectAction, WorkerResult},
    errors::AmqpError,
    message::{Delivery, TapMessage},
    otel,
};
use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One item of the fan-in stream of a tap.
#[derive(Debug, Clone, PartialEq)]
pub enum TapEvent {
    /// A message received on one of the tap queues.
    Delivery(Delivery),
    /// The connection or channel was closed, or a consumer broke down.
    Closed(AmqpError),
}

/// Decides on a tapped message, given the number of messages accepted so far.
pub trait MessagePredicate: Send + Sync {
    fn eval(&self, message: &TapMessage, count: u64) -> bool;
}

/// A predicate with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct ConstantPredicate(pub bool);

impl MessagePredicate for ConstantPredicate {
    fn eval(&self, _message: &TapMessage, _count: u64) -> bool {
        self.0
    }
}

/// Holds once `limit` messages were accepted.
#[derive(Debug, Clone, Copy)]
pub struct LimitPredicate {
    limit: u64,
}

impl LimitPredicate {
    pub fn new(limit: u64) -> Self {
        LimitPredicate { limit }
    }
}

impl MessagePredicate for LimitPredicate {
    fn eval(&self, _message: &TapMessage, count: u64) -> bool {
        count >= self.limit
    }
}

impl<F> MessagePredicate for F
where
    F: Fn(&TapMessage, u64) -> bool + Send + Sync,
{
    fn eval(&self, message: &TapMessage, count: u64) -> bool {
        self(message, count)
    }
}

/// Receives every accepted tapped message.
///
/// An error is fatal: the tap stops and reports it.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn consume(&self, message: TapMessage) -> Result<(), AmqpError>;
}

/// The state of a tap's message loop, kept across connection cycles.
pub struct MessageLoop {
    filter: Arc<dyn MessagePredicate>,
    termination: Arc<dyn MessagePredicate>,
    idle_timeout: Option<Duration>,
    count: u64,
    tracer: BoxedTracer,
}

impl Default for MessageLoop {
    /// Accepts everything and runs until cancelled.
    fn default() -> Self {
        MessageLoop::new(
            Arc::new(ConstantPredicate(true)),
            Arc::new(ConstantPredicate(false)),
            None,
        )
    }
}

impl MessageLoop {
    pub fn new(
        filter: Arc<dyn MessagePredicate>,
        termination: Arc<dyn MessagePredicate>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        MessageLoop {
            filter,
            termination,
            idle_timeout,
            count: 0,
            tracer: global::tracer("amqp tap"),
        }
    }

    /// Number of messages handed to the sink so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Runs until cancellation, a close signal, a sink error, the
    /// termination predicate or the idle timeout.
    ///
    /// Close signals are also reported on `err_sink`.
    ///
    /// # Returns
    /// `Reconnect` with the cause after a close signal, else `DoNotReconnect`
    /// with `Ok` or the sink's or idle timeout's error.
    pub async fn run(
        &mut self,
        token: &CancellationToken,
        sink: &dyn MessageSink,
        err_sink: &mpsc::UnboundedSender<AmqpError>,
        fanin: &mut mpsc::Receiver<TapEvent>,
    ) -> WorkerResult {
        let idle_timeout = self.idle_timeout;

        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("tap cancelled");
                    return (ReconnectAction::DoNotReconnect, Ok(()));
                }
                event = fanin.recv() => event,
                _ = tokio::time::sleep(idle_timeout.unwrap_or_default()), if idle_timeout.is_some() => {
                    let timeout = idle_timeout.unwrap_or_default();
                    debug!("no message received within {:?}", timeout);
                    return (ReconnectAction::DoNotReconnect, Err(AmqpError::IdleTimeout(timeout)));
                }
            };

            let delivery = match event {
                Some(TapEvent::Delivery(delivery)) => delivery,
                Some(TapEvent::Closed(err)) => {
                    warn!(error = err.to_string(), "tap connection closed");
                    let _ = err_sink.send(err.clone());
                    return (ReconnectAction::Reconnect, Err(err));
                }
                None => {
                    let err = AmqpError::ConnectionLost("all tap consumers ended".to_owned());
                    let _ = err_sink.send(err.clone());
                    return (ReconnectAction::Reconnect, Err(err));
                }
            };

            let message = TapMessage::new(delivery, Utc::now());

            if self.filter.eval(&message, self.count) {
                if let Err(err) = self.forward(sink, &message).await {
                    return (ReconnectAction::DoNotReconnect, Err(err));
                }
                self.count += 1;
            }

            if self.termination.eval(&message, self.count) {
                debug!(count = self.count, "termination condition reached");
                return (ReconnectAction::DoNotReconnect, Ok(()));
            }
        }
    }

    async fn forward(&self, sink: &dyn MessageSink, message: &TapMessage) -> Result<(), AmqpError> {
        let name = format!("tap {}", message.delivery.exchange);
        let (_ctx, mut span) = otel::new_span(&message.delivery.headers, &self.tracer, &name);

        match sink.consume(message.clone()).await {
            Ok(()) => {
                span.set_status(Status::Ok);
                Ok(())
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("message sink failed"),
                });
                Err(err)
            }
        }
    }
}
