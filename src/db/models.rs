use std::fmt;

use crate::chroma::MAX_NRANKS;

/// Parameters every song in an index was hashed and segmented with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexParams {
    /// Hashes per segment.
    pub hps: usize,
    /// Hashes shared by consecutive segments.
    pub overlap: usize,
    /// Quantization level of the rank hash.
    pub nranks: u32,
    /// Kurtosis gate applied before hashing.
    pub min_kurtosis: f64,
}

impl IndexParams {
    /// Check that songs can be hashed and segmented with these parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.hps == 0 {
            return Err("segment length must be positive".to_string());
        }
        if self.overlap >= self.hps {
            return Err(format!(
                "overlap {} must be smaller than the segment length {}",
                self.overlap, self.hps
            ));
        }
        if !(2..=MAX_NRANKS).contains(&self.nranks) {
            return Err(format!("nranks must be in 2..={}, got {}", MAX_NRANKS, self.nranks));
        }
        Ok(())
    }
}

impl fmt::Display for IndexParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hps={} overlap={} nranks={} min_kurtosis={}",
            self.hps, self.overlap, self.nranks, self.min_kurtosis
        )
    }
}

/// A song row read from the index.
#[derive(Debug, Clone, PartialEq)]
pub struct Song {
    pub id: i64,
    pub title: String,
    pub frames: i64,
    pub segments: i64,
}

/// Index-wide counts for the `stats` command.
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub songs: u64,
    pub segments: u64,
    pub postings: u64,
    pub distinct_terms: u64,
    pub params: Option<IndexParams>,
}
