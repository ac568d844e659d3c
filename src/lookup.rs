//! Injected lookup tables for article classification
//!
//! Both tables are built once at startup from externally supplied data and
//! are read-only afterwards, so decoders can share them freely.

use std::collections::{HashMap, HashSet};

/// Maps article ids to topic ids.
///
/// The raw assignment table covers every namespace; construction keeps only
/// the ids that belong to the article namespace, so a successful lookup also
/// certifies that the page is an article.
#[derive(Debug, Clone, Default)]
pub struct TopicTable {
    topics: HashMap<u32, u32>,
}

impl TopicTable {
    /// Build from a raw assignment table, keeping only article-namespace ids.
    pub fn from_assignments(assignments: HashMap<u32, u32>, article_ids: &HashSet<u32>) -> Self {
        let topics = assignments
            .into_iter()
            .filter(|(page_id, _)| article_ids.contains(page_id))
            .collect();
        Self { topics }
    }

    /// Build from a table that is already restricted to articles.
    pub fn from_articles(topics: HashMap<u32, u32>) -> Self {
        Self { topics }
    }

    /// Topic of the given article, or `None` when the id is not a known
    /// article.
    pub fn topic_of(&self, article_id: u32) -> Option<u32> {
        self.topics.get(&article_id).copied()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// Known bot accounts keyed by user id.
#[derive(Debug, Clone, Default)]
pub struct BotTable {
    bots: HashMap<u32, String>,
}

impl BotTable {
    pub fn new(bots: HashMap<u32, String>) -> Self {
        Self { bots }
    }

    pub fn name_of(&self, user_id: u32) -> Option<&str> {
        self.bots.get(&user_id).map(String::as_str)
    }

    pub fn is_bot(&self, user_id: u32) -> bool {
        self.bots.contains_key(&user_id)
    }
}
