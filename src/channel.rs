// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module handles the creation of AMQP connections and channels with
//! lapin. `AmqpDialer` establishes a connection and opens a channel on it,
//! `AmqpSession` bundles both and implements the `Session` operations the tap
//! and the publisher rely on.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    message::{
        field_table_from_headers, headers_from_field_table, timestamp_from_amqp,
        timestamp_to_amqp, Delivery, Headers, MessageProperties, Publishing, Routing,
    },
    queue::{QueueBinding, QueueDefinition},
    redial::Dialer,
    session::{CloseStream, DeliveryStream, Session},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeBindOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Dials the broker at a fixed URI.
#[derive(Debug, Clone)]
pub struct AmqpDialer {
    uri: String,
    connection_name: String,
}

impl AmqpDialer {
    /// Creates a dialer for the given `amqp://` or `amqps://` URI.
    ///
    /// The connection name shows up in the broker's management UI.
    pub fn new(uri: &str, connection_name: &str) -> Self {
        AmqpDialer {
            uri: uri.to_owned(),
            connection_name: connection_name.to_owned(),
        }
    }
}

#[async_trait]
impl Dialer for AmqpDialer {
    type Session = AmqpSession;

    /// Establishes a connection and creates a channel on it.
    async fn dial(&self) -> Result<AmqpSession, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(AmqpSession::new(conn, c))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }
}

/// An open lapin connection together with its current channel.
pub struct AmqpSession {
    connection: Connection,
    channel: RwLock<Channel>,
}

impl AmqpSession {
    pub fn new(connection: Connection, channel: Channel) -> Self {
        AmqpSession {
            connection,
            channel: RwLock::new(channel),
        }
    }

    fn channel(&self) -> Result<Channel, AmqpError> {
        self.channel
            .read()
            .map(|channel| channel.clone())
            .map_err(|_| AmqpError::InternalError)
    }
}

#[async_trait]
impl Session for AmqpSession {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel()?
            .exchange_declare(
                &def.name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: false,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.channel()?
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to delete the exchange");
                AmqpError::DeleteExchangeError(name.to_owned())
            })
    }

    async fn bind_exchange(&self, binding: &ExchangeBinding) -> Result<(), AmqpError> {
        debug!(
            "binding exchange: {} to the exchange: {} with the key: {}",
            binding.destination, binding.source, binding.routing_key
        );

        self.channel()?
            .exchange_bind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                ExchangeBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind exchange to exchange");
                AmqpError::BindingExchangeToExchangeError(
                    binding.destination.clone(),
                    binding.source.clone(),
                )
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel()?
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: false,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        match self
            .channel()?
            .queue_delete(name, QueueDeleteOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to delete the queue");
                Err(AmqpError::DeleteQueueError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel()?
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel()?
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: true,
                    exclusive: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery::from(delivery)),
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    Err(AmqpError::ConsumerError(err.to_string()))
                }
            })
            .boxed())
    }

    async fn publish(&self, routing: &Routing, publishing: &Publishing) -> Result<(), AmqpError> {
        match self
            .channel()?
            .basic_publish(
                routing.exchange(),
                routing.key(),
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &publishing.body,
                basic_properties(&publishing.properties, routing.headers()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn notify_close(&self) -> CloseStream {
        let (tx, rx) = mpsc::unbounded_channel();

        let connection_tx = tx.clone();
        self.connection.on_error(move |err| {
            let _ = connection_tx.send(AmqpError::ConnectionLost(err.to_string()));
        });

        match self.channel() {
            Ok(channel) => channel.on_error(move |err| {
                let _ = tx.send(AmqpError::ConnectionLost(err.to_string()));
            }),
            Err(err) => error!(
                error = err.to_string(),
                "channel unavailable for close notification"
            ),
        }

        UnboundedReceiverStream::new(rx).boxed()
    }

    async fn reopen_channel(&self) -> Result<(), AmqpError> {
        let channel = self.connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        let mut current = self.channel.write().map_err(|_| AmqpError::InternalError)?;
        *current = channel;
        debug!("channel reopened");

        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.connection
            .close(REPLY_SUCCESS, "Normal shutdown")
            .await
            .map_err(|err| AmqpError::CloseConnectionError(err.to_string()))
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        let headers = delivery
            .properties
            .headers()
            .as_ref()
            .map(headers_from_field_table)
            .unwrap_or_default();
        let properties = message_properties(&delivery.properties);

        Delivery {
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            headers,
            body: delivery.data,
            properties,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        }
    }
}

fn short_string(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|v| v.as_str().to_owned())
}

fn message_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: short_string(props.content_type()),
        content_encoding: short_string(props.content_encoding()),
        delivery_mode: *props.delivery_mode(),
        priority: *props.priority(),
        correlation_id: short_string(props.correlation_id()),
        reply_to: short_string(props.reply_to()),
        expiration: short_string(props.expiration()),
        message_id: short_string(props.message_id()),
        timestamp: (*props.timestamp()).and_then(timestamp_from_amqp),
        kind: short_string(props.kind()),
        user_id: short_string(props.user_id()),
        app_id: short_string(props.app_id()),
    }
}

fn basic_properties(props: &MessageProperties, headers: &Headers) -> BasicProperties {
    let mut amqp = BasicProperties::default().with_headers(field_table_from_headers(headers));

    if let Some(v) = &props.content_type {
        amqp = amqp.with_content_type(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.content_encoding {
        amqp = amqp.with_content_encoding(ShortString::from(v.clone()));
    }
    if let Some(v) = props.delivery_mode {
        amqp = amqp.with_delivery_mode(v);
    }
    if let Some(v) = props.priority {
        amqp = amqp.with_priority(v);
    }
    if let Some(v) = &props.correlation_id {
        amqp = amqp.with_correlation_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.reply_to {
        amqp = amqp.with_reply_to(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.expiration {
        amqp = amqp.with_expiration(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.message_id {
        amqp = amqp.with_message_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.timestamp {
        amqp = amqp.with_timestamp(timestamp_to_amqp(v));
    }
    if let Some(v) = &props.kind {
        amqp = amqp.with_type(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.user_id {
        amqp = amqp.with_user_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.app_id {
        amqp = amqp.with_app_id(ShortString::from(v.clone()));
    }

    amqp
}
