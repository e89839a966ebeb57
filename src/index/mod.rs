//! The inverted index as seen by a query: capability traits, an owned handle
//! with a shared document → song cache, and reduction of raw hits to
//! per-song scores.

pub mod sqlite;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use thiserror::Error;

use crate::chroma::Hash;
use crate::db::DbError;
use crate::db::models::IndexParams;
use crate::query::segments::WeightedQuery;

pub use sqlite::{IndexWriter, SqliteIndex};

/// Identifier of one indexed segment.
pub type DocId = i64;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Index unavailable: {0}")]
    Unavailable(String),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Unknown document {0}")]
    UnknownDocument(DocId),
}

/// A scored document returned by a search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DocScore {
    pub doc: DocId,
    pub score: f64,
}

/// Corpus-level term statistics used by pruning strategies.
#[derive(Debug, Clone, Default)]
pub struct CorpusStats {
    pub num_docs: u64,
    doc_frequency: HashMap<Hash, u64>,
}

impl CorpusStats {
    pub fn new(num_docs: u64, doc_frequency: HashMap<Hash, u64>) -> Self {
        Self {
            num_docs,
            doc_frequency,
        }
    }

    /// Number of documents containing `hash`.
    pub fn doc_frequency(&self, hash: Hash) -> u64 {
        self.doc_frequency.get(&hash).copied().unwrap_or(0)
    }

    pub fn vocabulary_size(&self) -> usize {
        self.doc_frequency.len()
    }
}

/// A per-task view of the index. Searchers are not shared between tasks.
pub trait SegmentSearcher: Send {
    /// Score documents against a weighted query, best first. `max_results`
    /// of 0 means no limit.
    fn search(&mut self, query: &WeightedQuery, max_results: usize) -> Result<Vec<DocScore>, IndexError>;

    /// Identifier of the song a document belongs to.
    fn song_of(&mut self, doc: DocId) -> Result<String, IndexError>;
}

/// The index collaborator.
pub trait IndexService: Send + Sync {
    fn open_searcher(&self) -> Result<Box<dyn SegmentSearcher>, IndexError>;

    /// Segmentation and hashing parameters shared by the whole index.
    fn params(&self) -> Result<IndexParams, IndexError>;

    fn num_docs(&self) -> Result<u64, IndexError>;

    fn corpus_stats(&self) -> Result<CorpusStats, IndexError>;
}

/// An opened index plus the state shared by every query that uses it.
///
/// The handle is created once, shared (behind an `Arc`) by concurrent
/// queries, and closed by dropping it.
pub struct IndexHandle {
    service: Box<dyn IndexService>,
    song_cache: RwLock<HashMap<DocId, String>>,
    stats: OnceLock<Arc<CorpusStats>>,
}

impl IndexHandle {
    pub fn new<S: IndexService + 'static>(service: S) -> Self {
        Self {
            service: Box::new(service),
            song_cache: RwLock::new(HashMap::new()),
            stats: OnceLock::new(),
        }
    }

    /// Open the SQLite index at `path`.
    pub fn open_sqlite(path: &std::path::Path) -> Result<Self, IndexError> {
        Ok(Self::new(SqliteIndex::open(path)?))
    }

    pub fn searcher(&self) -> Result<Box<dyn SegmentSearcher>, IndexError> {
        self.service.open_searcher()
    }

    pub fn params(&self) -> Result<IndexParams, IndexError> {
        self.service.params()
    }

    pub fn num_docs(&self) -> Result<u64, IndexError> {
        self.service.num_docs()
    }

    /// Corpus statistics, loaded on first use and kept for the handle's lifetime.
    pub fn corpus_stats(&self) -> Result<Arc<CorpusStats>, IndexError> {
        if let Some(stats) = self.stats.get() {
            return Ok(Arc::clone(stats));
        }
        let loaded = Arc::new(self.service.corpus_stats()?);
        // A concurrent loader may have won; both computed the same thing
        Ok(Arc::clone(self.stats.get_or_init(|| loaded)))
    }

    /// Resolve a document to its song, reading through the shared cache.
    pub fn song_of(&self, searcher: &mut dyn SegmentSearcher, doc: DocId) -> Result<String, IndexError> {
        {
            let cache = self.song_cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(song) = cache.get(&doc) {
                return Ok(song.clone());
            }
        }

        let song = searcher.song_of(doc)?;
        log::trace!("Song cache miss: doc {} -> {}", doc, song);
        self.song_cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc, song.clone());
        Ok(song)
    }

    pub fn cached_songs(&self) -> usize {
        self.song_cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Collapse document hits to one score per song: the best-scoring
    /// document of each song.
    pub fn reduce_max_per_song(
        &self,
        hits: &[DocScore],
        searcher: &mut dyn SegmentSearcher,
    ) -> Result<HashMap<String, f64>, IndexError> {
        let mut per_song: HashMap<String, f64> = HashMap::new();
        for hit in hits {
            let song = self.song_of(searcher, hit.doc)?;
            per_song
                .entry(song)
                .and_modify(|s| *s = s.max(hit.score))
                .or_insert(hit.score);
        }
        Ok(per_song)
    }
}
