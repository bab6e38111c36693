// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish-Replay Engine
//!
//! Reads persisted messages from a source and feeds them into the publish
//! channel, resolving routing overrides and reproducing the pacing of the
//! original capture.

use crate::{
    errors::AmqpError,
    message::{Headers, PublishMessage, Routing},
    persistent::PersistentMessage,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Returns the optional value if present, else the default.
pub fn select_optional_or_default<'a>(optional: Option<&'a str>, default: &'a str) -> &'a str {
    optional.unwrap_or(default)
}

/// Resolves where a persisted message is published to.
///
/// Exchange and routing key overrides apply when present, even when empty.
/// Header overrides apply when non-empty.
pub fn routing_from_message(
    opt_exchange: Option<&str>,
    opt_key: Option<&str>,
    opt_headers: &Headers,
    message: &PersistentMessage,
) -> Routing {
    let headers = if opt_headers.is_empty() {
        message.headers.clone().unwrap_or_default()
    } else {
        opt_headers.clone()
    };

    Routing::new(
        select_optional_or_default(opt_exchange, &message.exchange),
        select_optional_or_default(opt_key, &message.routing_key),
        headers,
    )
}

/// Scales a duration; fractions of a nanosecond are truncated.
pub fn mult_duration(duration: Duration, factor: f64) -> Duration {
    Duration::from_nanos((duration.as_nanos() as f64 * factor) as u64)
}

/// The pause between publishing `previous` and `current`.
///
/// Zero when either message is missing. A fixed delay wins over the captured
/// timestamps; otherwise the captured gap is scaled by `speed`. Out of order
/// timestamps yield zero.
pub fn duration_between_messages(
    previous: Option<&PersistentMessage>,
    current: Option<&PersistentMessage>,
    speed: f64,
    fixed_delay: Option<Duration>,
) -> Duration {
    let (Some(previous), Some(current)) = (previous, current) else {
        return Duration::ZERO;
    };

    if let Some(fixed) = fixed_delay {
        return fixed;
    }

    let gap = (current.x_rabtap_received_timestamp - previous.x_rabtap_received_timestamp)
        .to_std()
        .unwrap_or_default();

    mult_duration(gap, speed)
}

/// Waits between two consecutive messages of a replay.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Delayer: Send + Sync {
    async fn delay(&self, previous: &PersistentMessage, current: &PersistentMessage);
}

/// Reproduces the captured pacing, scaled by a speed factor.
pub struct ReplayDelayer {
    speed: f64,
    fixed_delay: Option<Duration>,
    token: CancellationToken,
}

impl ReplayDelayer {
    pub fn new(speed: f64, fixed_delay: Option<Duration>, token: CancellationToken) -> Self {
        ReplayDelayer {
            speed,
            fixed_delay,
            token,
        }
    }
}

#[async_trait]
impl Delayer for ReplayDelayer {
    async fn delay(&self, previous: &PersistentMessage, current: &PersistentMessage) {
        let pause =
            duration_between_messages(Some(previous), Some(current), self.speed, self.fixed_delay);
        if pause.is_zero() {
            return;
        }

        debug!("sleeping for {:?}", pause);
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

/// Yields the persisted messages of a replay in capture order.
#[async_trait]
pub trait MessageSource: Send {
    /// Returns the next message, or `None` once the source is exhausted.
    async fn next_message(&mut self) -> Result<Option<PersistentMessage>, AmqpError>;
}

/// Publishes every message of `source` onto `pub_ch`.
///
/// # Parameters
/// * `pub_ch` - The channel drained by the publisher
/// * `opt_exchange`, `opt_key` - Routing overrides, applied when present
/// * `opt_headers` - Header override, applied when non-empty
/// * `source` - Where the messages come from
/// * `delayer` - Paces consecutive messages
///
/// # Returns
/// `Ok` once the source signals its end with `Ok(None)`. A source error is
/// returned at once, before anything further is published. The channel is
/// closed when this function returns.
pub async fn publish_message_stream<S, D>(
    pub_ch: mpsc::Sender<PublishMessage>,
    opt_exchange: Option<&str>,
    opt_key: Option<&str>,
    opt_headers: &Headers,
    source: &mut S,
    delayer: &D,
) -> Result<(), AmqpError>
where
    S: MessageSource + ?Sized,
    D: Delayer + ?Sized,
{
    let mut previous: Option<PersistentMessage> = None;

    while let Some(message) = source.next_message().await? {
        if let Some(previous) = &previous {
            delayer.delay(previous, &message).await;
        }

        let routing = routing_from_message(opt_exchange, opt_key, opt_headers, &message);
        debug!(
            exchange = routing.exchange(),
            key = routing.key(),
            "replaying message"
        );

        pub_ch
            .send(PublishMessage {
                routing,
                publishing: message.to_publishing(),
            })
            .await
            .map_err(|_| AmqpError::PublishChannelClosed)?;

        previous = Some(message);
    }

    debug!("replay source exhausted");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::message::HeaderValue;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;

    fn headers(key: &str, value: &str) -> Headers {
        let mut headers = Headers::new();
        headers.insert(key.to_owned(), HeaderValue::from(value));
        headers
    }

    fn recorded() -> PersistentMessage {
        PersistentMessage {
            exchange: "exchange".to_owned(),
            routing_key: "key".to_owned(),
            headers: Some(headers("A", "B")),
            ..Default::default()
        }
    }

    fn received_at(nanos: i64) -> PersistentMessage {
        PersistentMessage {
            x_rabtap_received_timestamp: Utc.timestamp_nanos(nanos),
            ..Default::default()
        }
    }

    /// Hands out pre-built read results, then end of stream.
    pub(crate) struct ScriptedSource {
        results: VecDeque<Result<Option<PersistentMessage>, AmqpError>>,
        pub(crate) reads: usize,
    }

    impl ScriptedSource {
        pub(crate) fn new(results: Vec<Result<Option<PersistentMessage>, AmqpError>>) -> Self {
            ScriptedSource {
                results: results.into(),
                reads: 0,
            }
        }

        pub(crate) fn messages(messages: Vec<PersistentMessage>) -> Self {
            ScriptedSource::new(messages.into_iter().map(|m| Ok(Some(m))).collect())
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn next_message(&mut self) -> Result<Option<PersistentMessage>, AmqpError> {
            self.reads += 1;
            self.results.pop_front().unwrap_or(Ok(None))
        }
    }

    #[test]
    fn should_use_recorded_routing_without_overrides() {
        let routing = routing_from_message(None, None, &Headers::new(), &recorded());

        assert_eq!(routing, Routing::new("exchange", "key", headers("A", "B")));
    }

    #[test]
    fn should_apply_exchange_and_key_overrides() {
        let routing =
            routing_from_message(Some("oexchange"), Some("okey"), &Headers::new(), &recorded());

        assert_eq!(routing, Routing::new("oexchange", "okey", headers("A", "B")));
    }

    #[test]
    fn should_apply_header_override() {
        let routing = routing_from_message(None, None, &headers("A", "X"), &recorded());

        assert_eq!(routing, Routing::new("exchange", "key", headers("A", "X")));
    }

    #[test]
    fn should_treat_empty_override_as_present() {
        let routing = routing_from_message(Some(""), Some(""), &Headers::new(), &recorded());

        assert_eq!(routing.exchange(), "");
        assert_eq!(routing.key(), "");
    }

    #[test]
    fn should_default_to_empty_headers() {
        let message = PersistentMessage::raw(b"body".to_vec());

        let routing = routing_from_message(Some("ex"), None, &Headers::new(), &message);

        assert!(routing.headers().is_empty());
    }

    #[test]
    fn should_select_optional_or_default() {
        assert_eq!(select_optional_or_default(None, "default"), "default");
        assert_eq!(select_optional_or_default(Some("optional"), "default"), "optional");
    }

    #[test]
    fn should_multiply_duration() {
        assert_eq!(
            mult_duration(Duration::from_nanos(100), 0.5),
            Duration::from_nanos(50)
        );
        assert_eq!(
            mult_duration(Duration::from_secs(1), 2.0),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn should_not_delay_when_a_message_is_missing() {
        let message = received_at(0);
        let fixed = Some(Duration::from_millis(123));

        assert_eq!(duration_between_messages(None, None, 1.0, None), Duration::ZERO);
        assert_eq!(duration_between_messages(Some(&message), None, 1.0, fixed), Duration::ZERO);
        assert_eq!(duration_between_messages(None, Some(&message), 1.0, fixed), Duration::ZERO);
    }

    #[test]
    fn should_use_fixed_delay_verbatim() {
        let first = received_at(0);
        let second = received_at(1_000_000_000);

        let delay = duration_between_messages(
            Some(&first),
            Some(&second),
            1.0,
            Some(Duration::from_nanos(123)),
        );

        assert_eq!(delay, Duration::from_nanos(123));
    }

    #[test]
    fn should_scale_captured_gap() {
        let first = received_at(0);
        let second = received_at(1000);

        assert_eq!(
            duration_between_messages(Some(&first), Some(&second), 0.5, None),
            Duration::from_nanos(500)
        );
        assert_eq!(
            duration_between_messages(Some(&first), Some(&second), 1.0, None),
            Duration::from_nanos(1000)
        );
    }

    #[test]
    fn should_not_delay_for_out_of_order_timestamps() {
        let first = received_at(1000);
        let second = received_at(0);

        assert_eq!(
            duration_between_messages(Some(&first), Some(&second), 1.0, None),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn should_publish_single_message_and_close_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut delayer = MockDelayer::new();
        delayer.expect_delay().never();
        let message = PersistentMessage {
            body: b"Hello".to_vec(),
            ..recorded()
        };

        let result = publish_message_stream(
            tx,
            None,
            Some("okey"),
            &Headers::new(),
            &mut ScriptedSource::messages(vec![message]),
            &delayer,
        )
        .await;

        assert_eq!(result, Ok(()));
        let published = rx.recv().await.unwrap();
        assert_eq!(published.routing, Routing::new("exchange", "okey", headers("A", "B")));
        assert_eq!(published.publishing.body, b"Hello".to_vec());
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn should_return_source_error_without_publishing() {
        let (tx, mut rx) = mpsc::channel(1);
        let delayer = MockDelayer::new();
        let failure = AmqpError::ReplaySourceError("unexpected EOF".to_owned());

        let result = publish_message_stream(
            tx,
            None,
            None,
            &Headers::new(),
            &mut ScriptedSource::new(vec![Err(failure.clone())]),
            &delayer,
        )
        .await;

        assert_eq!(result, Err(failure));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn should_stop_reading_after_source_error() {
        let (tx, mut rx) = mpsc::channel(2);
        let failure = AmqpError::ReplaySourceError("invalid base64".to_owned());
        let mut source = ScriptedSource::new(vec![
            Ok(Some(recorded())),
            Err(failure.clone()),
            Ok(Some(recorded())),
        ]);
        let mut delayer = MockDelayer::new();
        delayer.expect_delay().never();

        let result =
            publish_message_stream(tx, None, None, &Headers::new(), &mut source, &delayer).await;

        assert_eq!(result, Err(failure));
        assert_eq!(source.reads, 2);
        assert!(rx.recv().await.is_some());
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn should_delay_between_consecutive_messages_only() {
        let (tx, mut rx) = mpsc::channel(3);
        let mut delayer = MockDelayer::new();
        delayer.expect_delay().times(2).returning(|_, _| ());

        let result = publish_message_stream(
            tx,
            None,
            None,
            &Headers::new(),
            &mut ScriptedSource::messages(vec![recorded(), recorded(), recorded()]),
            &delayer,
        )
        .await;

        assert_eq!(result, Ok(()));
        for _ in 0..3 {
            assert!(rx.recv().await.is_some());
        }
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn should_fail_when_publisher_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let result = publish_message_stream(
            tx,
            None,
            None,
            &Headers::new(),
            &mut ScriptedSource::messages(vec![recorded()]),
            &MockDelayer::new(),
        )
        .await;

        assert_eq!(result, Err(AmqpError::PublishChannelClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn should_sleep_for_captured_gap() {
        let delayer = ReplayDelayer::new(1.0, None, CancellationToken::new());
        let first = received_at(0);
        let second = received_at(2_000_000_000);
        let started = tokio::time::Instant::now();

        delayer.delay(&first, &second).await;

        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_sleeping_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let delayer = ReplayDelayer::new(1.0, Some(Duration::from_secs(60)), token);
        let started = tokio::time::Instant::now();

        delayer.delay(&received_at(0), &received_at(1)).await;

        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
