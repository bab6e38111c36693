// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Types
//!
//! Transport-neutral representations of what flows through a tap or a replay:
//! received deliveries, their properties and headers, and the routed
//! publishings produced by the replay engine. Conversions to and from the
//! lapin wire types live next to the types they convert.

use chrono::{DateTime, TimeZone, Utc};
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Message headers, keyed by header name.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A single header value.
///
/// AMQP knows a dozen numeric widths; they are folded into `Int` and `Float`
/// when a delivery is received and published back as the widest AMQP type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Void,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<HeaderValue>),
    Table(Headers),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<&AMQPValue> for HeaderValue {
    fn from(value: &AMQPValue) -> Self {
        match value {
            AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
            AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
            AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
            AMQPValue::Double(v) => HeaderValue::Float(*v),
            AMQPValue::DecimalValue(v) => {
                HeaderValue::Float(f64::from(v.value) / 10f64.powi(i32::from(v.scale)))
            }
            AMQPValue::ShortString(v) => HeaderValue::String(v.as_str().to_owned()),
            AMQPValue::LongString(v) => {
                HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
            }
            AMQPValue::FieldArray(v) => {
                HeaderValue::Array(v.as_slice().iter().map(HeaderValue::from).collect())
            }
            AMQPValue::Timestamp(v) => HeaderValue::Int(*v as i64),
            AMQPValue::FieldTable(v) => HeaderValue::Table(headers_from_field_table(v)),
            AMQPValue::ByteArray(v) => {
                HeaderValue::String(String::from_utf8_lossy(v.as_slice()).into_owned())
            }
            AMQPValue::Void => HeaderValue::Void,
        }
    }
}

impl From<&HeaderValue> for AMQPValue {
    fn from(value: &HeaderValue) -> Self {
        match value {
            HeaderValue::Void => AMQPValue::Void,
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Float(v) => AMQPValue::Double(*v),
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Array(v) => AMQPValue::FieldArray(FieldArray::from(
                v.iter().map(AMQPValue::from).collect::<Vec<_>>(),
            )),
            HeaderValue::Table(v) => AMQPValue::FieldTable(field_table_from_headers(v)),
        }
    }
}

/// Converts an AMQP field table into headers.
pub fn headers_from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_owned(), HeaderValue::from(value)))
        .collect()
}

/// Converts headers into an AMQP field table.
pub fn field_table_from_headers(headers: &Headers) -> FieldTable {
    let btree: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), AMQPValue::from(value)))
        .collect();

    FieldTable::from(btree)
}

/// Basic properties of a message, apart from its headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

/// AMQP carries timestamps as seconds since the epoch.
pub(crate) fn timestamp_from_amqp(seconds: u64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(i64::try_from(seconds).ok()?, 0).single()
}

pub(crate) fn timestamp_to_amqp(timestamp: &DateTime<Utc>) -> u64 {
    u64::try_from(timestamp.timestamp()).unwrap_or_default()
}

/// One message received from the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// A tapped delivery together with the time the tap received it.
#[derive(Debug, Clone, PartialEq)]
pub struct TapMessage {
    pub delivery: Delivery,
    pub received_timestamp: DateTime<Utc>,
}

impl TapMessage {
    pub fn new(delivery: Delivery, received_timestamp: DateTime<Utc>) -> Self {
        TapMessage {
            delivery,
            received_timestamp,
        }
    }
}

/// The resolved destination of one outgoing publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Routing {
    exchange: String,
    key: String,
    headers: Headers,
}

impl Routing {
    pub fn new(exchange: &str, key: &str, headers: Headers) -> Self {
        Routing {
            exchange: exchange.to_owned(),
            key: key.to_owned(),
            headers,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Body and properties of an outgoing message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Publishing {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// A routed message waiting on the publish channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMessage {
    pub routing: Routing,
    pub publishing: Publishing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_fold_amqp_integers_into_int() {
        let mut btree = BTreeMap::new();
        btree.insert(ShortString::from("short"), AMQPValue::ShortInt(7));
        btree.insert(ShortString::from("long"), AMQPValue::LongUInt(42));
        btree.insert(
            ShortString::from("name"),
            AMQPValue::LongString(LongString::from("tap")),
        );

        let headers = headers_from_field_table(&FieldTable::from(btree));

        assert_eq!(headers.get("short"), Some(&HeaderValue::Int(7)));
        assert_eq!(headers.get("long"), Some(&HeaderValue::Int(42)));
        assert_eq!(headers.get("name"), Some(&HeaderValue::from("tap")));
    }

    #[test]
    fn should_keep_nested_tables_when_converting_back() {
        let mut inner = Headers::new();
        inner.insert("count".to_owned(), HeaderValue::Int(3));
        let mut headers = Headers::new();
        headers.insert("x-death".to_owned(), HeaderValue::Table(inner));
        headers.insert("flag".to_owned(), HeaderValue::Bool(true));

        let table = field_table_from_headers(&headers);

        assert_eq!(headers_from_field_table(&table), headers);
    }

    #[test]
    fn should_deserialize_untagged_header_values() {
        let headers: Headers =
            serde_json::from_str(r#"{"A": "B", "n": 1, "f": 1.5, "l": [true, null]}"#).unwrap();

        assert_eq!(headers.get("A"), Some(&HeaderValue::from("B")));
        assert_eq!(headers.get("n"), Some(&HeaderValue::Int(1)));
        assert_eq!(headers.get("f"), Some(&HeaderValue::Float(1.5)));
        assert_eq!(
            headers.get("l"),
            Some(&HeaderValue::Array(vec![
                HeaderValue::Bool(true),
                HeaderValue::Void
            ]))
        );
    }
}
