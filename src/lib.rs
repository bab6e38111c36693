// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Taps AMQP exchanges without disturbing their consumers and replays
//! captured messages back to a broker.

mod otel;

pub mod channel;
pub mod config;
pub mod connector;
pub mod errors;
pub mod exchange;
pub mod fanin;
pub mod message;
pub mod message_loop;
pub mod persistent;
pub mod publisher;
pub mod queue;
pub mod redial;
pub mod replay;
pub mod session;
pub mod tap;
pub mod topology;
