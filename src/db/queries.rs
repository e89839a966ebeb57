use super::models::{IndexParams, IndexStats, Song};
use super::{Database, DbError, Result};
use crate::chroma::{Hash, PITCH_CLASSES};
use crate::query::segments::{segments, term_counts};
use rusqlite::{OptionalExtension, params};
use std::collections::HashMap;

const META_HPS: &str = "segment_length";
const META_OVERLAP: &str = "overlap";
const META_NRANKS: &str = "nranks";
const META_MIN_KURTOSIS: &str = "min_kurtosis";

impl Database {
    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM index_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_meta(conn: &rusqlite::Connection, key: &str, value: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO index_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn parse_meta<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get_meta(key)? {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| DbError::BadMeta {
                key: key.to_string(),
                value,
            }),
        }
    }

    /// The segmentation and hashing parameters of this index, if set.
    pub fn index_params(&self) -> Result<Option<IndexParams>> {
        let hps: Option<usize> = self.parse_meta(META_HPS)?;
        let Some(hps) = hps else {
            return Ok(None);
        };
        Ok(Some(IndexParams {
            hps,
            overlap: self.parse_meta(META_OVERLAP)?.unwrap_or(0),
            nranks: self.parse_meta(META_NRANKS)?.unwrap_or(3),
            min_kurtosis: self
                .parse_meta(META_MIN_KURTOSIS)?
                .unwrap_or(f64::NEG_INFINITY),
        }))
    }

    /// Record `requested` as the index parameters, or check it against the
    /// ones already recorded.
    pub fn ensure_index_params(&self, requested: &IndexParams) -> Result<IndexParams> {
        requested.validate().map_err(DbError::InvalidParams)?;
        if let Some(existing) = self.index_params()? {
            if existing != *requested {
                return Err(DbError::ParamMismatch {
                    existing: existing.to_string(),
                    requested: requested.to_string(),
                });
            }
            return Ok(existing);
        }

        let tx = self.conn.unchecked_transaction()?;
        Self::set_meta(&tx, META_HPS, &requested.hps.to_string())?;
        Self::set_meta(&tx, META_OVERLAP, &requested.overlap.to_string())?;
        Self::set_meta(&tx, META_NRANKS, &requested.nranks.to_string())?;
        Self::set_meta(&tx, META_MIN_KURTOSIS, &requested.min_kurtosis.to_string())?;
        tx.commit()?;
        log::info!("Initialized index with {}", requested);
        Ok(*requested)
    }

    /// Segment `hashes` with the index parameters and store the song with
    /// its chroma histogram, replacing any previous version with the same
    /// title. Returns the song id.
    pub fn add_song(
        &self,
        title: &str,
        hashes: &[Hash],
        histogram: Option<&[f64; PITCH_CLASSES]>,
        p: &IndexParams,
    ) -> Result<i64> {
        let histogram = histogram
            .map(|h| {
                serde_json::to_string(&h.to_vec()).map_err(|e| DbError::BadMeta {
                    key: format!("histogram of {}", title),
                    value: e.to_string(),
                })
            })
            .transpose()?;

        let tx = self.conn.unchecked_transaction()?;

        // Cascades to segments and postings
        tx.execute("DELETE FROM songs WHERE title = ?1", params![title])?;
        tx.execute(
            "INSERT INTO songs (title, frames, histogram) VALUES (?1, ?2, ?3)",
            params![title, hashes.len() as i64, histogram],
        )?;
        let song_id = tx.last_insert_rowid();

        {
            let mut insert_segment = tx.prepare_cached(
                "INSERT INTO segments (song_id, position, length) VALUES (?1, ?2, ?3)",
            )?;
            let mut insert_posting = tx.prepare_cached(
                "INSERT INTO postings (term, segment_id, tf) VALUES (?1, ?2, ?3)",
            )?;

            for seg in segments(hashes, p.hps, p.overlap) {
                let counts = term_counts(seg.hashes);
                let length: u32 = counts.values().sum();
                // A fully gated segment has nothing to match on
                if length == 0 {
                    continue;
                }
                insert_segment.execute(params![song_id, seg.index as i64, length])?;
                let segment_id = tx.last_insert_rowid();
                for (term, tf) in counts {
                    insert_posting.execute(params![term, segment_id, tf])?;
                }
            }
        }

        tx.commit()?;
        Ok(song_id)
    }

    pub fn remove_song(&self, title: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM songs WHERE title = ?1", params![title])?;
        Ok(n > 0)
    }

    /// Score segments against weighted terms.
    ///
    /// `score(d) = Σ weight · tf(term, d) / length(d)`, best first, ties by
    /// segment id. `max_results` of 0 returns every match.
    pub fn search(&self, terms: &[(Hash, f32)], max_results: usize) -> Result<Vec<(i64, f64)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT p.segment_id, p.tf, s.length
             FROM postings p
             JOIN segments s ON s.id = p.segment_id
             WHERE p.term = ?1",
        )?;

        let mut scores: HashMap<i64, f64> = HashMap::new();
        for &(term, weight) in terms {
            let rows = stmt.query_map(params![term], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (segment_id, tf, length) = row?;
                *scores.entry(segment_id).or_insert(0.0) +=
                    weight as f64 * tf as f64 / length.max(1) as f64;
            }
        }

        let mut hits: Vec<(i64, f64)> = scores.into_iter().collect();
        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        if max_results > 0 {
            hits.truncate(max_results);
        }
        Ok(hits)
    }

    /// Title of the song owning a segment.
    pub fn song_of_segment(&self, segment_id: i64) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT s.title FROM segments g JOIN songs s ON s.id = g.song_id WHERE g.id = ?1",
                params![segment_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn segment_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM segments", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Number of segments each term occurs in.
    pub fn doc_frequencies(&self) -> Result<HashMap<Hash, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT term, COUNT(*) FROM postings GROUP BY term")?;
        let df = stmt
            .query_map([], |row| Ok((row.get::<_, Hash>(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(df)
    }

    /// Mean chroma profile of the corpus, normalized to unit sum. Songs
    /// stored without a histogram don't contribute.
    pub fn chroma_profile(&self) -> Result<Option<[f64; PITCH_CLASSES]>> {
        let mut stmt = self
            .conn
            .prepare("SELECT title, histogram FROM songs WHERE histogram IS NOT NULL")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut sum = [0.0; PITCH_CLASSES];
        for row in rows {
            let (title, value) = row?;
            let histogram: [f64; PITCH_CLASSES] = serde_json::from_str::<Vec<f64>>(&value)
                .ok()
                .and_then(|v| v.try_into().ok())
                .ok_or_else(|| DbError::BadMeta {
                    key: format!("histogram of {}", title),
                    value: value.clone(),
                })?;
            for (s, h) in sum.iter_mut().zip(histogram) {
                *s += h;
            }
        }

        let total: f64 = sum.iter().sum();
        Ok((total > 0.0).then(|| sum.map(|s| s / total)))
    }

    pub fn list_songs(&self) -> Result<Vec<Song>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.title, s.frames, COUNT(g.id)
             FROM songs s
             LEFT JOIN segments g ON g.song_id = s.id
             GROUP BY s.id
             ORDER BY s.title",
        )?;
        let songs = stmt
            .query_map([], |row| {
                Ok(Song {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    frames: row.get(2)?,
                    segments: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(songs)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let count = |sql: &str| -> Result<u64> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(IndexStats {
            songs: count("SELECT COUNT(*) FROM songs")?,
            segments: count("SELECT COUNT(*) FROM segments")?,
            postings: count("SELECT COUNT(*) FROM postings")?,
            distinct_terms: count("SELECT COUNT(DISTINCT term) FROM postings")?,
            params: self.index_params()?,
        })
    }
}
