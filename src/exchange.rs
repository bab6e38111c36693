// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! This module provides types describing broker exchanges and
//! exchange-to-exchange bindings. A tap mirrors traffic by binding a private
//! fanout exchange to the exchange under observation, so both the declaration
//! and the binding are expressed here independently of the transport.

/// A tap exchange: a non-durable fanout exchange that is not auto-deleted.
///
/// Its lifetime is managed explicitly, so it survives the loss of the
/// connection that declared it until the tap removes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition.
    ///
    /// # Parameters
    /// * `name` - Name of the exchange to declare
    ///
    /// # Returns
    /// The definition, ready to be passed to `Session::declare_exchange`
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Binding of a destination exchange to a source exchange.
///
/// Every message routed by the source exchange that matches the routing key is
/// also delivered to the destination exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeBinding {
    pub(crate) destination: String,
    pub(crate) source: String,
    pub(crate) routing_key: String,
}

impl ExchangeBinding {
    /// Creates a new binding that feeds the given destination exchange.
    ///
    /// Source and routing key are empty until set with `source` and `routing_key`.
    pub fn new(destination: &str) -> ExchangeBinding {
        ExchangeBinding {
            destination: destination.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the exchange messages are copied from.
    pub fn source(mut self, source: &str) -> Self {
        self.source = source.to_owned();
        self
    }

    /// Sets the routing key (binding pattern) for the binding.
    ///
    /// Use `#` on topic exchanges, an exact key on direct exchanges and an
    /// empty key on fanout or headers exchanges.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
