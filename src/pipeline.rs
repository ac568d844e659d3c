//! Pipeline orchestration
//!
//! Spawns up to `page_buffer_size` concurrent per-file decoders over the dump
//! source, merges their pages into one bounded channel and hands the stream
//! to the enrichment pool. The first error cancels the whole pipeline and is
//! retrievable from the latch once the output stream closes.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::abstracts::AbstractLookup;
use crate::config::IngestConfig;
use crate::decoder::{self, DecoderEnv};
use crate::enrich;
use crate::error::{FailLatch, IngestError};
use crate::lookup::{BotTable, TopicTable};
use crate::source::DumpSource;
use crate::types::EvolvingPage;

/// Digest a dump into a stream of evolving pages.
///
/// The revision channel of every received page must be fully drained, or the
/// latch's token cancelled; doing neither eventually deadlocks the pipeline.
/// Output delivered before a failure is valid. After the returned stream
/// closes, [`FailLatch::take`] yields the first error, if any.
pub fn ingest<S>(
    latch: Arc<FailLatch>,
    source: S,
    topics: Arc<TopicTable>,
    bots: Arc<BotTable>,
    abstracts: Arc<dyn AbstractLookup>,
    config: IngestConfig,
) -> mpsc::Receiver<EvolvingPage>
where
    S: DumpSource + 'static,
{
    let (pages, merged) = mpsc::channel(config.page_buffer_size);
    let enriched = enrich::enrich(latch.clone(), merged, abstracts, &config);
    tokio::spawn(decode_stage(latch, source, topics, bots, pages, config));
    enriched
}

async fn decode_stage<S>(
    latch: Arc<FailLatch>,
    mut source: S,
    topics: Arc<TopicTable>,
    bots: Arc<BotTable>,
    pages: mpsc::Sender<EvolvingPage>,
    config: IngestConfig,
) where
    S: DumpSource,
{
    let cancel = latch.cancel_token();
    // bounds concurrent decoders, and with them open readers
    let slots = Arc::new(Semaphore::new(config.page_buffer_size));
    let mut decoders = JoinSet::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let stream = match source.next_stream().await {
            Ok(Some(stream)) => stream,
            Ok(None) => break,
            Err(e) => {
                latch.fail(IngestError::Source(e));
                break;
            }
        };
        let permit = tokio::select! {
            // dropping the stream closes its reader
            _ = cancel.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let env = DecoderEnv {
            topics: topics.clone(),
            bots: bots.clone(),
            pages: pages.clone(),
            cancel: cancel.clone(),
            revision_buffer_size: config.revision_buffer_size,
        };
        let latch = latch.clone();
        decoders.spawn(async move {
            let _permit = permit;
            debug!("decoding dump file {:?}", stream.name);
            if let Err(e) = decoder::decode_stream(stream.reader, stream.name, &env).await {
                latch.fail(e);
            }
        });

        if config.restrict_to_first_file {
            break;
        }
    }

    while decoders.join_next().await.is_some() {}
    info!("all decoders finished");
    // dropping `pages` closes the merged channel
}
