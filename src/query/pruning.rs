//! Policies deciding which hashes of a segment become query terms.

use std::sync::Arc;

use super::segments::{WeightedTerm, term_counts};
use crate::chroma::Hash;
use crate::index::CorpusStats;

/// Selects and weights the terms of one segment.
///
/// `load` is called once per query session with the corpus statistics of the
/// index before any call to `select`. Excluded hashes must never be returned.
pub trait QueryPruningStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `load` must be given corpus statistics before use.
    fn needs_stats(&self) -> bool {
        false
    }

    fn load(&mut self, _stats: Arc<CorpusStats>) {}

    fn select(&self, hashes: &[Hash]) -> Vec<WeightedTerm>;
}

/// Every valid hash is a term, weighted by how often it occurs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPruning;

impl QueryPruningStrategy for NoPruning {
    fn name(&self) -> &'static str {
        "none"
    }

    fn select(&self, hashes: &[Hash]) -> Vec<WeightedTerm> {
        term_counts(hashes)
            .into_iter()
            .map(|(hash, n)| WeightedTerm {
                hash,
                weight: n as f32,
            })
            .collect()
    }
}

/// Drops hashes that are too common across the corpus to discriminate, and
/// hashes absent from the corpus (they can't match anything).
#[derive(Debug, Clone)]
pub struct DocumentFrequencyPruning {
    max_df_ratio: f64,
    stats: Option<Arc<CorpusStats>>,
}

impl DocumentFrequencyPruning {
    pub fn new(max_df_ratio: f64) -> Self {
        Self {
            max_df_ratio,
            stats: None,
        }
    }

    fn keep(&self, stats: &CorpusStats, hash: Hash) -> bool {
        let df = stats.doc_frequency(hash);
        if df == 0 || stats.num_docs == 0 {
            return false;
        }
        df as f64 / stats.num_docs as f64 <= self.max_df_ratio
    }
}

impl QueryPruningStrategy for DocumentFrequencyPruning {
    fn name(&self) -> &'static str {
        "document-frequency"
    }

    fn needs_stats(&self) -> bool {
        true
    }

    fn load(&mut self, stats: Arc<CorpusStats>) {
        log::debug!(
            "Pruning with max df ratio {} over {} documents, {} terms",
            self.max_df_ratio,
            stats.num_docs,
            stats.vocabulary_size()
        );
        self.stats = Some(stats);
    }

    fn select(&self, hashes: &[Hash]) -> Vec<WeightedTerm> {
        let counts = term_counts(hashes);
        let Some(stats) = &self.stats else {
            log::warn!("Document frequency pruning used before corpus statistics were loaded");
            return NoPruning.select(hashes);
        };
        counts
            .into_iter()
            .filter(|&(hash, _)| self.keep(stats, hash))
            .map(|(hash, n)| WeightedTerm {
                hash,
                weight: n as f32,
            })
            .collect()
    }
}
