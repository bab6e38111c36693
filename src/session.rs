// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Session
//!
//! A `Session` bundles one open connection and channel to the broker. The
//! connector vends a fresh session per connection cycle and lends it to a
//! single worker; the session is never reused once its connection dropped.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    message::{Delivery, Publishing, Routing},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Stream of deliveries from one consumer. An `Err` item means the consumer
/// broke down and no further deliveries will follow.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Stream of connection or channel close notifications.
pub type CloseStream = BoxStream<'static, AmqpError>;

/// Operations the tap and the publisher need from a broker connection.
///
/// A failed operation may close the channel on the broker side; callers that
/// want to keep using the session afterwards call `reopen_channel` first.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Session: Send + Sync {
    /// Declares an exchange.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Deletes an exchange, whether or not it is in use.
    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError>;

    /// Binds a destination exchange to a source exchange.
    async fn bind_exchange(&self, binding: &ExchangeBinding) -> Result<(), AmqpError>;

    /// Declares a queue.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Deletes a queue, whether or not it is in use.
    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError>;

    /// Binds a queue to an exchange.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Starts an auto-acknowledging, exclusive consumer on the queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Publishes a message.
    async fn publish(&self, routing: &Routing, publishing: &Publishing) -> Result<(), AmqpError>;

    /// Registers for notifications about the connection or channel closing.
    fn notify_close(&self) -> CloseStream;

    /// Replaces the channel after a channel-level failure closed it.
    async fn reopen_channel(&self) -> Result<(), AmqpError>;

    /// Closes the underlying connection.
    async fn close(&self) -> Result<(), AmqpError>;
}
