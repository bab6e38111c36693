// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Tap Topology
//!
//! This module creates the broker objects a tap needs. For every tapped
//! exchange a private fanout exchange is bound to it as destination, so it
//! receives a copy of every message matching the binding key, and an
//! exclusive queue is bound to the private exchange and consumed.
//!
//! Any failure while setting up a tap removes what was created before the
//! failing step, so no exchange or queue is left behind on the broker.
//!
//! The main components are:
//! - `setup_tap`: creates the exchange and queue for one tapped exchange
//! - `TapTopology`: owns the names of everything created, for later removal

use crate::{
    config::ExchangeConfiguration,
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
    session::{DeliveryStream, Session},
};
use tracing::{debug, error};
use uuid::Uuid;

const TAP_SUFFIX_LEN: usize = 12;

/// Name of the private exchange mirroring `exchange`.
pub fn tap_exchange_name(exchange: &str, suffix: &str) -> String {
    format!("__tap-exchange-for-{exchange}-{suffix}")
}

/// Name of the queue holding the mirrored messages of `exchange`.
pub fn tap_queue_name(exchange: &str, suffix: &str) -> String {
    format!("__tap-queue-for-{exchange}-{suffix}")
}

/// Sets up a single tap to an exchange.
///
/// Creates an exchange-to-exchange binding where the tap exchange (of type
/// fanout) receives all messages published to the tapped exchange matching
/// the binding key, then an exclusive, auto-deleted queue bound to the tap
/// exchange.
///
/// # Parameters
/// * `session` - The session to declare the tap on
/// * `config` - The exchange to tap and the binding key
///
/// # Returns
/// `(tap_exchange_name, tap_queue_name)`. When a step fails, whatever was
/// declared before it is removed and the step's error is returned.
pub async fn setup_tap<S>(
    session: &S,
    config: &ExchangeConfiguration,
) -> Result<(String, String), AmqpError>
where
    S: Session + ?Sized,
{
    let id = Uuid::new_v4().simple().to_string();
    let suffix = &id[..TAP_SUFFIX_LEN];
    let tap_exchange = tap_exchange_name(&config.exchange, suffix);
    let tap_queue = tap_queue_name(&config.exchange, suffix);

    // the tap exchange is not auto-deleted, it is removed explicitly
    session
        .declare_exchange(&ExchangeDefinition::new(&tap_exchange))
        .await?;

    let binding = ExchangeBinding::new(&tap_exchange)
        .source(&config.exchange)
        .routing_key(&config.binding_key);
    if let Err(err) = session.bind_exchange(&binding).await {
        discard_tap(session, None, &tap_exchange).await;
        return Err(err);
    }

    let queue = QueueDefinition::new(&tap_queue).delete().exclusive();
    if let Err(err) = session.declare_queue(&queue).await {
        discard_tap(session, None, &tap_exchange).await;
        return Err(err);
    }

    let binding = QueueBinding::new(&tap_queue)
        .exchange(&tap_exchange)
        .routing_key(&config.binding_key);
    if let Err(err) = session.bind_queue(&binding).await {
        discard_tap(session, Some(&tap_queue), &tap_exchange).await;
        return Err(err);
    }

    debug!(
        "tapping exchange: {} through exchange: {} and queue: {}",
        config.exchange, tap_exchange, tap_queue
    );

    Ok((tap_exchange, tap_queue))
}

/// Removes a partially created tap after a failed step.
///
/// The failed operation closed the channel, so a new one is opened first.
/// Failures are logged only, the caller reports the original error.
async fn discard_tap<S>(session: &S, queue: Option<&str>, exchange: &str)
where
    S: Session + ?Sized,
{
    if let Err(err) = session.reopen_channel().await {
        error!(
            error = err.to_string(),
            exchange, "cannot remove tap, no channel available"
        );
        return;
    }

    if let Some(queue) = queue {
        if let Err(err) = session.delete_queue(queue).await {
            error!(error = err.to_string(), "failed to remove queue {}", queue);
        }
    }

    if let Err(err) = session.delete_exchange(exchange).await {
        error!(error = err.to_string(), "failed to remove exchange {}", exchange);
    }
}

/// The tap exchanges and queues created by one tap.
///
/// Names are recorded as taps are set up and forgotten once removed.
#[derive(Debug, Default)]
pub struct TapTopology {
    exchanges: Vec<String>,
    queues: Vec<String>,
}

impl TapTopology {
    pub fn new() -> Self {
        TapTopology::default()
    }

    pub fn exchanges(&self) -> &[String] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Sets up a tap for every configured exchange and starts consuming.
    ///
    /// Stops at the first failing exchange and returns its error; the taps
    /// set up until then stay recorded so that `remove_taps` can remove them.
    pub async fn setup_taps_for_exchanges<S>(
        &mut self,
        session: &S,
        configs: &[ExchangeConfiguration],
    ) -> Result<Vec<DeliveryStream>, AmqpError>
    where
        S: Session + ?Sized,
    {
        let mut streams = Vec::with_capacity(configs.len());

        for config in configs {
            let (exchange, queue) = setup_tap(session, config).await?;

            match session.consume(&queue, &queue).await {
                Ok(stream) => streams.push(stream),
                Err(err) => {
                    discard_tap(session, Some(&queue), &exchange).await;
                    return Err(err);
                }
            }

            self.exchanges.push(exchange);
            self.queues.push(queue);
        }

        Ok(streams)
    }

    /// Deletes every recorded queue and exchange, best effort.
    pub async fn remove_taps<S>(&mut self, session: &S)
    where
        S: Session + ?Sized,
    {
        for queue in std::mem::take(&mut self.queues) {
            if let Err(err) = session.delete_queue(&queue).await {
                error!(error = err.to_string(), "failed to remove queue {}", queue);
                let _ = session.reopen_channel().await;
            }
        }

        self.remove_exchanges(session).await;
    }

    /// Deletes exchanges left over by a previous connection.
    ///
    /// Their queues were exclusive to that connection, which the connector
    /// closed before redialing, so they are already gone.
    pub async fn remove_leftovers<S>(&mut self, session: &S)
    where
        S: Session + ?Sized,
    {
        self.queues.clear();
        self.remove_exchanges(session).await;
    }

    async fn remove_exchanges<S>(&mut self, session: &S)
    where
        S: Session + ?Sized,
    {
        for exchange in std::mem::take(&mut self.exchanges) {
            match session.delete_exchange(&exchange).await {
                Ok(()) => debug!("exchange: {} was removed", exchange),
                Err(err) => {
                    error!(error = err.to_string(), "failed to remove exchange {}", exchange);
                    let _ = session.reopen_channel().await;
                }
            }
        }
    }
}
