// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Persistent Messages
//!
//! The JSON record a tapped message is saved as and replayed from. Field
//! names are PascalCase, the body is base64 encoded and timestamps are
//! RFC 3339. Every field may be absent; replay falls back to defaults.
//!
//! A file holds a stream of such records, read one at a time by
//! [`JsonMessageSource`] and written by [`JsonMessageSink`].

use crate::{
    errors::AmqpError,
    message::{Headers, MessageProperties, Publishing, TapMessage},
    message_loop::MessageSink,
    replay::MessageSource,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{de::IoRead, StreamDeserializer};
use std::{io::Read, io::Write, sync::Mutex};

/// A captured message as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PersistentMessage {
    pub headers: Option<Headers>,
    pub content_type: String,
    pub content_encoding: String,
    pub delivery_mode: u8,
    pub priority: u8,
    #[serde(rename = "CorrelationID")]
    pub correlation_id: String,
    pub reply_to: String,
    pub expiration: String,
    #[serde(rename = "MessageID")]
    pub message_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "UserID")]
    pub user_id: String,
    #[serde(rename = "AppID")]
    pub app_id: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
    pub x_rabtap_received_timestamp: DateTime<Utc>,
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_owned())
}

fn non_zero(value: u8) -> Option<u8> {
    (value != 0).then_some(value)
}

impl PersistentMessage {
    /// A message consisting of a body only, e.g. read from a raw file.
    pub fn raw(body: Vec<u8>) -> Self {
        PersistentMessage {
            body,
            x_rabtap_received_timestamp: Utc::now(),
            ..Default::default()
        }
    }

    /// Body and properties to publish; routing is resolved separately.
    pub fn to_publishing(&self) -> Publishing {
        Publishing {
            body: self.body.clone(),
            properties: MessageProperties {
                content_type: non_empty(&self.content_type),
                content_encoding: non_empty(&self.content_encoding),
                delivery_mode: non_zero(self.delivery_mode),
                priority: non_zero(self.priority),
                correlation_id: non_empty(&self.correlation_id),
                reply_to: non_empty(&self.reply_to),
                expiration: non_empty(&self.expiration),
                message_id: non_empty(&self.message_id),
                timestamp: self.timestamp,
                kind: non_empty(&self.kind),
                user_id: non_empty(&self.user_id),
                app_id: non_empty(&self.app_id),
            },
        }
    }
}

impl From<&TapMessage> for PersistentMessage {
    fn from(message: &TapMessage) -> Self {
        let delivery = &message.delivery;
        let props = &delivery.properties;

        PersistentMessage {
            headers: Some(delivery.headers.clone()),
            content_type: props.content_type.clone().unwrap_or_default(),
            content_encoding: props.content_encoding.clone().unwrap_or_default(),
            delivery_mode: props.delivery_mode.unwrap_or_default(),
            priority: props.priority.unwrap_or_default(),
            correlation_id: props.correlation_id.clone().unwrap_or_default(),
            reply_to: props.reply_to.clone().unwrap_or_default(),
            expiration: props.expiration.clone().unwrap_or_default(),
            message_id: props.message_id.clone().unwrap_or_default(),
            timestamp: props.timestamp,
            kind: props.kind.clone().unwrap_or_default(),
            user_id: props.user_id.clone().unwrap_or_default(),
            app_id: props.app_id.clone().unwrap_or_default(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            body: delivery.body.clone(),
            x_rabtap_received_timestamp: message.received_timestamp,
        }
    }
}

/// Reads a stream of concatenated JSON records, one message per call.
///
/// Reads run on the blocking thread pool, so a slow file or pipe does not
/// stall the publisher sharing the task with the replay.
pub struct JsonMessageSource<R: Read> {
    stream: Option<StreamDeserializer<'static, IoRead<R>, PersistentMessage>>,
}

impl<R: Read + Send + 'static> JsonMessageSource<R> {
    pub fn new(reader: R) -> Self {
        JsonMessageSource {
            stream: Some(serde_json::Deserializer::from_reader(reader).into_iter()),
        }
    }
}

#[async_trait]
impl<R: Read + Send + 'static> MessageSource for JsonMessageSource<R> {
    async fn next_message(&mut self) -> Result<Option<PersistentMessage>, AmqpError> {
        // only a panicked read leaves no reader behind
        let Some(mut stream) = self.stream.take() else {
            return Ok(None);
        };

        let (stream, next) = tokio::task::spawn_blocking(move || {
            let next = stream.next();
            (stream, next)
        })
        .await
        .map_err(|err| AmqpError::ReplaySourceError(err.to_string()))?;

        self.stream = Some(stream);
        next.transpose()
            .map_err(|err| AmqpError::ReplaySourceError(err.to_string()))
    }
}

/// Writes every tapped message as one JSON record per line.
pub struct JsonMessageSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonMessageSink<W> {
    pub fn new(writer: W) -> Self {
        JsonMessageSink {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> Result<W, AmqpError> {
        self.writer.into_inner().map_err(|_| AmqpError::InternalError)
    }
}

#[async_trait]
impl<W: Write + Send> MessageSink for JsonMessageSink<W> {
    async fn consume(&self, message: TapMessage) -> Result<(), AmqpError> {
        let record = PersistentMessage::from(&message);
        let mut writer = self.writer.lock().map_err(|_| AmqpError::InternalError)?;

        serde_json::to_writer(&mut *writer, &record)
            .map_err(|err| AmqpError::SinkError(err.to_string()))?;
        writeln!(writer).map_err(|err| AmqpError::SinkError(err.to_string()))?;
        writer
            .flush()
            .map_err(|err| AmqpError::SinkError(err.to_string()))
    }
}
