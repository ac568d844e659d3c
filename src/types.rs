//! Core types flowing through the ingestion pipeline

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// `user_id` value assumed by revisions committed by an anonymous contributor.
pub const ANONYMOUS_USER_ID: u32 = 0;

/// Content hashes in the dump are base-36, zero-padded to this length.
/// Shorter values indicate a corrupt or missing hash.
pub const SHA1_LEN: usize = 31;

/// A page moving through the pipeline while its edit history is still being
/// decoded.
///
/// `revisions` is single-consumer and must be fully drained, or the pipeline
/// cancelled; an abandoned receiver eventually deadlocks the producer once
/// the channel buffer fills.
#[derive(Debug)]
pub struct EvolvingPage {
    /// Stable numeric identifier of the article.
    pub page_id: u32,
    /// Article title as it appears in the dump.
    pub title: String,
    /// Empty until the enrichment stage fills it from the abstract lookup.
    pub abstract_text: String,
    /// Coarse grouping assigned via the article-to-topic table.
    pub topic_id: u32,
    /// Revisions in document order. Closed by the producer after the last
    /// revision, or immediately when the page is abandoned.
    pub revisions: mpsc::Receiver<Revision>,
}

/// One saved edit of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub id: u32,
    /// 0 denotes an anonymous contributor.
    pub user_id: u32,
    /// Whether the contributor appears in the injected bot table.
    pub is_bot: bool,
    /// Full revision text, passed through as-is.
    pub text: String,
    /// Base-36 content hash as it appears in the dump.
    pub sha1: String,
    /// 0 when this revision's content is new on the page; n > 0 when it is
    /// identical in content to an earlier revision with n revisions strictly
    /// between them.
    pub is_revert: u32,
    pub timestamp: DateTime<Utc>,
}
