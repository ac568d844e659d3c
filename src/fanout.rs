//! Stream fan-out
//!
//! Replicates one page stream (with its nested revision streams) to N
//! independent consumers while preserving each replica's view of the input
//! order. Sends use a randomized ready-send with a small window of attempts
//! in flight, so one slow replica cannot starve the others round-robin-style;
//! the bounded replica buffers still apply backpressure.

use futures::stream::{FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::IngestConfig;
use crate::types::{EvolvingPage, Revision};

/// Concurrent send attempts kept in flight per item.
const SEND_WINDOW: usize = 3;

/// Create `n` copies of the page stream. With `n == 1` the input is returned
/// unchanged. On cancellation all outputs are closed without draining.
///
/// # Panics
///
/// Panics if `n` is zero.
pub fn fan_out(
    cancel: CancellationToken,
    input: mpsc::Receiver<EvolvingPage>,
    n: usize,
    config: &IngestConfig,
) -> Vec<mpsc::Receiver<EvolvingPage>> {
    assert!(n >= 1, "fan_out requires at least one output");
    if n == 1 {
        return vec![input];
    }

    let mut senders = Vec::with_capacity(n);
    let mut receivers = Vec::with_capacity(n);
    for _ in 0..n {
        let (sender, receiver) = mpsc::channel(config.page_buffer_size);
        senders.push(sender);
        receivers.push(receiver);
    }

    tokio::spawn(fan_out_pages(
        cancel,
        input,
        senders,
        config.revision_buffer_size,
    ));

    receivers
}

async fn fan_out_pages(
    cancel: CancellationToken,
    mut input: mpsc::Receiver<EvolvingPage>,
    outputs: Vec<mpsc::Sender<EvolvingPage>>,
    revision_buffer: usize,
) {
    loop {
        let page = tokio::select! {
            _ = cancel.cancelled() => return,
            page = input.recv() => match page {
                Some(page) => page,
                None => return,
            },
        };
        let EvolvingPage {
            page_id,
            title,
            abstract_text,
            topic_id,
            revisions,
        } = page;

        let mut revision_senders = Vec::with_capacity(outputs.len());
        let mut replica_revisions = Vec::with_capacity(outputs.len());
        for _ in &outputs {
            let (sender, receiver) = mpsc::channel(revision_buffer);
            revision_senders.push(sender);
            replica_revisions.push(receiver);
        }
        tokio::spawn(fan_out_revisions(
            cancel.clone(),
            revisions,
            revision_senders,
        ));

        let copies: Vec<(usize, EvolvingPage)> = replica_revisions
            .into_iter()
            .enumerate()
            .map(|(target, revisions)| {
                (
                    target,
                    EvolvingPage {
                        page_id,
                        title: title.clone(),
                        abstract_text: abstract_text.clone(),
                        topic_id,
                        revisions,
                    },
                )
            })
            .collect();
        if !scatter(&cancel, &outputs, copies).await {
            return;
        }
    }
}

async fn fan_out_revisions(
    cancel: CancellationToken,
    mut input: mpsc::Receiver<Revision>,
    outputs: Vec<mpsc::Sender<Revision>>,
) {
    loop {
        let revision = tokio::select! {
            _ = cancel.cancelled() => return,
            revision = input.recv() => match revision {
                Some(revision) => revision,
                None => return,
            },
        };
        let copies: Vec<(usize, Revision)> = (0..outputs.len())
            .map(|target| (target, revision.clone()))
            .collect();
        if !scatter(&cancel, &outputs, copies).await {
            return;
        }
    }
}

/// Deliver one item to every output, visiting targets in random order with at
/// most [`SEND_WINDOW`] sends in flight. Returns `false` on cancellation. A
/// replica that hung up is skipped; fan-out never inspects payloads or
/// reports errors of its own.
async fn scatter<T: Send + 'static>(
    cancel: &CancellationToken,
    outputs: &[mpsc::Sender<T>],
    mut copies: Vec<(usize, T)>,
) -> bool {
    copies.shuffle(&mut rand::thread_rng());
    let mut queue = copies.into_iter();
    let mut in_flight = FuturesUnordered::new();

    for _ in 0..SEND_WINDOW {
        if let Some((target, item)) = queue.next() {
            in_flight.push(deliver(outputs[target].clone(), item));
        }
    }

    while !in_flight.is_empty() {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = in_flight.next() => {
                if let Some((target, item)) = queue.next() {
                    in_flight.push(deliver(outputs[target].clone(), item));
                }
            }
        }
    }
    true
}

async fn deliver<T: Send>(output: mpsc::Sender<T>, item: T) {
    let _ = output.send(item).await;
}
