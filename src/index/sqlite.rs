use std::path::{Path, PathBuf};

use super::{CorpusStats, DocId, DocScore, IndexError, IndexService, SegmentSearcher};
use crate::chroma::{Hash, PITCH_CLASSES};
use crate::db::Database;
use crate::db::models::IndexParams;
use crate::query::segments::WeightedQuery;

/// A SQLite index opened for querying.
///
/// Holds only the path and the parameters read at open time; every searcher
/// gets its own read-only connection.
#[derive(Debug, Clone)]
pub struct SqliteIndex {
    path: PathBuf,
    params: IndexParams,
}

impl SqliteIndex {
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        if !path.exists() {
            return Err(IndexError::Unavailable(format!(
                "no index at {}",
                path.display()
            )));
        }
        let db = Database::open_read_only(path)?;
        let params = db.index_params()?.ok_or_else(|| {
            IndexError::Unavailable(format!("{} has no songs indexed yet", path.display()))
        })?;
        log::debug!("Opened index {} ({})", path.display(), params);
        Ok(Self {
            path: path.to_path_buf(),
            params,
        })
    }

    pub fn params(&self) -> &IndexParams {
        &self.params
    }

    /// Mean chroma profile of the indexed songs, if any were recorded.
    pub fn chroma_profile(&self) -> Result<Option<[f64; PITCH_CLASSES]>, IndexError> {
        Ok(Database::open_read_only(&self.path)?.chroma_profile()?)
    }
}

pub struct SqliteSearcher {
    db: Database,
}

impl SegmentSearcher for SqliteSearcher {
    fn search(&mut self, query: &WeightedQuery, max_results: usize) -> Result<Vec<DocScore>, IndexError> {
        let terms: Vec<(Hash, f32)> = query.terms.iter().map(|t| (t.hash, t.weight)).collect();
        let hits = self.db.search(&terms, max_results)?;
        Ok(hits
            .into_iter()
            .map(|(doc, score)| DocScore { doc, score })
            .collect())
    }

    fn song_of(&mut self, doc: DocId) -> Result<String, IndexError> {
        self.db
            .song_of_segment(doc)?
            .ok_or(IndexError::UnknownDocument(doc))
    }
}

impl IndexService for SqliteIndex {
    fn open_searcher(&self) -> Result<Box<dyn SegmentSearcher>, IndexError> {
        let db = Database::open_read_only(&self.path)?;
        Ok(Box::new(SqliteSearcher { db }))
    }

    fn params(&self) -> Result<IndexParams, IndexError> {
        Ok(self.params)
    }

    fn num_docs(&self) -> Result<u64, IndexError> {
        Ok(Database::open_read_only(&self.path)?.segment_count()?)
    }

    fn corpus_stats(&self) -> Result<CorpusStats, IndexError> {
        let db = Database::open_read_only(&self.path)?;
        let num_docs = db.segment_count()?;
        let df = db.doc_frequencies()?;
        log::debug!("Loaded corpus stats: {} documents, {} terms", num_docs, df.len());
        Ok(CorpusStats::new(num_docs, df))
    }
}

/// Write side of the index: owns a read-write connection and the parameters
/// every added song is segmented with.
pub struct IndexWriter {
    db: Database,
    params: IndexParams,
}

impl IndexWriter {
    /// Open (creating if needed) the index at `path`. An existing index must
    /// have been built with the same parameters.
    pub fn open(path: &Path, params: &IndexParams) -> Result<Self, IndexError> {
        let db = Database::open(path)?;
        let params = db.ensure_index_params(params)?;
        Ok(Self { db, params })
    }

    pub fn params(&self) -> &IndexParams {
        &self.params
    }

    /// Store a song's hash stream, and optionally its chroma histogram for
    /// the corpus profile, replacing any song with the same title.
    pub fn add_song(
        &self,
        title: &str,
        hashes: &[Hash],
        histogram: Option<&[f64; PITCH_CLASSES]>,
    ) -> Result<i64, IndexError> {
        Ok(self.db.add_song(title, hashes, histogram, &self.params)?)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexHandle;
    use crate::query::segments::WeightedTerm;

    fn params() -> IndexParams {
        IndexParams {
            hps: 4,
            overlap: 0,
            nranks: 3,
            min_kurtosis: f64::NEG_INFINITY,
        }
    }

    #[test]
    fn test_missing_index_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SqliteIndex::open(&dir.path().join("nope.db")),
            Err(IndexError::Unavailable(_))
        ));
    }

    #[test]
    fn test_empty_index_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        Database::open(&path).unwrap();
        assert!(matches!(
            SqliteIndex::open(&path),
            Err(IndexError::Unavailable(_))
        ));
    }

    #[test]
    fn test_search_through_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        {
            let writer = IndexWriter::open(&path, &params()).unwrap();
            writer.add_song("blue", &[1, 2, 3, 4, 5, 6, 7, 8], None).unwrap();
            writer.add_song("green", &[9, 9, 9, 1], None).unwrap();
        }

        let handle = IndexHandle::open_sqlite(&path).unwrap();
        assert_eq!(handle.params().unwrap(), params());
        assert_eq!(handle.num_docs().unwrap(), 3);
        assert_eq!(handle.corpus_stats().unwrap().doc_frequency(1), 2);

        let mut searcher = handle.searcher().unwrap();
        let query = WeightedQuery {
            segment: 0,
            terms: vec![WeightedTerm { hash: 9, weight: 1.0 }],
        };
        let hits = searcher.search(&query, 0).unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.75).abs() < 1e-12);
        let per_song = handle.reduce_max_per_song(&hits, searcher.as_mut()).unwrap();
        assert_eq!(per_song.len(), 1);
        assert!(per_song.contains_key("green"));
    }

    #[test]
    fn test_writer_rejects_other_params() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        IndexWriter::open(&path, &params()).unwrap();
        let mut other = params();
        other.nranks = 4;
        assert!(IndexWriter::open(&path, &other).is_err());
    }

    #[test]
    fn test_writer_rejects_unusable_params() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let bad = IndexParams {
            nranks: 40,
            ..params()
        };
        assert!(matches!(
            IndexWriter::open(&path, &bad),
            Err(IndexError::Db(crate::db::DbError::InvalidParams(_)))
        ));
    }
}
