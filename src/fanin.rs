// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Fan-In
//!
//! Merges any number of input streams into a single bounded channel. Items
//! of one input keep their order; items of different inputs interleave in
//! arrival order.

use futures_util::{stream::BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const FANIN_CAPACITY: usize = 16;

/// Spawns one forwarding task per input and returns the merged output.
///
/// # Parameters
/// * `token` - Stops all forwarders
/// * `inputs` - The streams to merge
///
/// # Returns
/// The merged output. It closes once every input ended, or promptly after
/// `token` is cancelled. Forwarders also stop when the output receiver is
/// dropped.
pub fn fanin<T>(token: CancellationToken, inputs: Vec<BoxStream<'static, T>>) -> mpsc::Receiver<T>
where
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(FANIN_CAPACITY);

    for mut input in inputs {
        let tx = tx.clone();
        let token = token.clone();

        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    item = input.next() => item,
                };

                let Some(item) = item else {
                    break;
                };

                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    rx
}
