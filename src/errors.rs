// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Tap
//!
//! This module provides the error type shared by every component of the crate.
//! The `AmqpError` enum covers connection management, tap topology setup,
//! message consumption, replay and configuration failures.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur while tapping or replaying messages.
///
/// Transport errors are logged where they happen and carried here as strings,
/// which keeps the type `Clone` so an error can be reported on an error sink
/// and returned to the caller at the same time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error closing the connection at the end of a session
    #[error("connection close failed: {0}")]
    CloseConnectionError(String),

    /// The broker connection or channel was closed underneath a worker
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The redial loop gave up before a worker finished
    #[error("session factory closed: {0}")]
    SessionFactoryClosed(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error deleting an exchange with the given name
    #[error("failure to delete an exchange `{0}`")]
    DeleteExchangeError(String),

    /// Error binding an exchange (destination) to another exchange (source)
    #[error("failure to bind exchange `{0}` to exchange `{1}`")]
    BindingExchangeToExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error deleting a queue with the given name
    #[error("failure to delete a queue `{0}`")]
    DeleteQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error declaring a consumer on a queue
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The message sink rejected a tapped message
    #[error("message sink failed: {0}")]
    SinkError(String),

    /// No message arrived within the configured idle window
    #[error("no message received within {0:?}")]
    IdleTimeout(Duration),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The receiving side of the publish channel is gone
    #[error("publish channel closed")]
    PublishChannelClosed,

    /// A captured message could not be read
    #[error("failure to read message: {0}")]
    ReplaySourceError(String),

    /// The supplied configuration is not usable
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl AmqpError {
    /// Returns true for the idle timeout, which ends a tap without a fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AmqpError::IdleTimeout(_))
    }

    /// Returns true for errors caused by a lost or unreachable broker.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::ChannelError(_)
                | AmqpError::ConnectionLost(_)
        )
    }
}
