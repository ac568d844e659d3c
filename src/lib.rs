//! revstream: streaming ingestion of encyclopedia meta-history dumps
//!
//! Digests the full edit history of a language edition, a set of XML
//! meta-history dump files delivered as decompressed readers, into one
//! record per qualifying article: its identifier, title and topic, and its
//! complete ordered sequence of revisions annotated with a bot flag and a
//! revert distance. Consumers process revisions lazily as they arrive; the
//! pipeline holds only a bounded working set in memory regardless of dump
//! size.
//!
//! The stages, leaves first:
//!
//! - [`source`] yields one reader per dump file.
//! - [`decoder`] drives a push-down state machine over each file's XML event
//!   stream, publishing pages and their revision streams.
//! - [`revert`] annotates every revision with its revert distance online.
//! - [`pipeline`] runs up to `page_buffer_size` decoders concurrently,
//!   merging their output into one bounded channel with first-error capture.
//! - an enrichment pool fills in each page's abstract and filters redirects.
//! - [`fanout`] replicates the final stream to N independent consumers.
//!
//! # Contract
//!
//! The revision channel of every received [`EvolvingPage`] must be fully
//! drained, or the pipeline cancelled through its latch token; doing neither
//! eventually deadlocks the producers.
//!
//! ```no_run
//! use std::sync::Arc;
//! use revstream::{
//!     ingest, AbstractLookup, BotTable, FailLatch, FsDumpSource,
//!     IngestConfig, RestAbstractLookup, RestLookupConfig, TopicTable,
//! };
//!
//! # async fn run(topics: TopicTable, bots: BotTable) -> anyhow::Result<()> {
//! let latch = Arc::new(FailLatch::default());
//! let source = FsDumpSource::new("/tmp/dumps")?;
//! let abstracts: Arc<dyn AbstractLookup> =
//!     Arc::new(RestAbstractLookup::new("en", RestLookupConfig::default())?);
//!
//! let mut pages = ingest(
//!     latch.clone(),
//!     source,
//!     Arc::new(topics),
//!     Arc::new(bots),
//!     abstracts,
//!     IngestConfig::default(),
//! );
//! while let Some(mut page) = pages.recv().await {
//!     while let Some(revision) = page.revisions.recv().await {
//!         // consume lazily
//!         let _ = revision;
//!     }
//! }
//! if let Some(err) = latch.take() {
//!     return Err(err.into());
//! }
//! # Ok(())
//! # }
//! ```

pub mod abstracts;
pub mod config;
pub mod decoder;
mod enrich;
pub mod error;
pub mod fanout;
pub mod lookup;
pub mod pipeline;
pub mod revert;
pub mod source;
pub mod types;

pub use abstracts::{
    AbstractError, AbstractLookup, PageAbstract, RestAbstractLookup, RestLookupConfig,
};
pub use config::IngestConfig;
pub use error::{FailLatch, IngestError, PageContext};
pub use fanout::fan_out;
pub use lookup::{BotTable, TopicTable};
pub use pipeline::ingest;
pub use source::{DumpSource, DumpStream, FsDumpSource, StaticDumpSource};
pub use types::{EvolvingPage, Revision, ANONYMOUS_USER_ID};
