//! Metadata enrichment stage
//!
//! A fixed pool of workers resolves each page's abstract through the injected
//! lookup, filters out redirects, failed lookups and revision-less pages, and
//! forwards the survivors. Filtered pages have their revisions drained on a
//! separate task so upstream decoders never block on a discarded page.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::abstracts::AbstractLookup;
use crate::config::IngestConfig;
use crate::error::FailLatch;
use crate::types::{EvolvingPage, Revision};

/// Spawn the enrichment pool between the decoder output and the consumer.
/// The returned channel closes once the input closes and all workers and
/// drains have finished.
pub(crate) fn enrich(
    latch: Arc<FailLatch>,
    input: mpsc::Receiver<EvolvingPage>,
    abstracts: Arc<dyn AbstractLookup>,
    config: &IngestConfig,
) -> mpsc::Receiver<EvolvingPage> {
    let (output, receiver) = mpsc::channel(config.page_buffer_size);
    let workers = config.page_buffer_size;
    let deadline = config.abstract_timeout();
    let revision_buffer = config.revision_buffer_size;
    let input = Arc::new(Mutex::new(input));
    let cancel = latch.cancel_token();

    tokio::spawn(async move {
        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(worker(
                input.clone(),
                output.clone(),
                abstracts.clone(),
                cancel.clone(),
                deadline,
                revision_buffer,
            ));
        }
        drop(output);
        while pool.join_next().await.is_some() {}
    });

    receiver
}

async fn worker(
    input: Arc<Mutex<mpsc::Receiver<EvolvingPage>>>,
    output: mpsc::Sender<EvolvingPage>,
    abstracts: Arc<dyn AbstractLookup>,
    cancel: CancellationToken,
    deadline: Duration,
    revision_buffer: usize,
) {
    loop {
        let page = { input.lock().await.recv().await };
        let Some(mut page) = page else { return };

        // a page with no revisions at all never reaches consumers; its
        // channel is already closed, so there is nothing to drain
        let Some(first) = page.revisions.recv().await else {
            debug!("dropping page {} with no revisions", page.page_id);
            continue;
        };

        // bottleneck: one remote query per page
        let resolved = timeout(deadline, abstracts.lookup(&page.title)).await;
        let summary = match resolved {
            Ok(Ok(summary)) if summary.page_id == page.page_id => summary,
            // failed lookup, deadline, or a title resolving to a different
            // page (a redirect): drop the page, keeping its producer
            // unblocked
            _ => {
                debug!("filtering page {} ({:?})", page.page_id, page.title);
                drain(page.revisions);
                continue;
            }
        };
        page.abstract_text = summary.abstract_text;

        // put the peeked revision back in front of the remaining stream
        let (sender, receiver) = mpsc::channel(revision_buffer);
        let upstream = std::mem::replace(&mut page.revisions, receiver);
        tokio::spawn(forward_revisions(first, upstream, sender, cancel.clone()));

        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = output.send(page) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// Empty a discarded page's revision stream so its decoder can move on.
fn drain(mut revisions: mpsc::Receiver<Revision>) {
    tokio::spawn(async move { while revisions.recv().await.is_some() {} });
}

async fn forward_revisions(
    first: Revision,
    mut upstream: mpsc::Receiver<Revision>,
    downstream: mpsc::Sender<Revision>,
    cancel: CancellationToken,
) {
    let mut pending = Some(first);
    loop {
        let revision = match pending.take() {
            Some(revision) => revision,
            None => match upstream.recv().await {
                Some(revision) => revision,
                // upstream closed; dropping `downstream` closes the replica
                None => return,
            },
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = downstream.send(revision) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}
