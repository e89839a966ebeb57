//! Pitch-shift candidates for a query.
//!
//! A key `k` is the rotation that, applied to every frame with
//! `ChromaVector::rotate(k)`, is expected to line the query up with the corpus.

use crate::chroma::{ChromaVector, PITCH_CLASSES};

/// Semitone shift in `[0, 12)`.
pub type TranspositionKey = i32;

/// Proposes transposition corrections, best first.
///
/// Implementations must be deterministic, return distinct keys in `[0, 12)`
/// and return fewer than `k` keys only when fewer are meaningful.
pub trait TranspositionEstimator: Send + Sync {
    fn find_key(&self, matrix: &[ChromaVector], k: usize) -> Vec<TranspositionKey>;
}

/// Krumhansl-Kessler major key profile, tonic first.
pub const KRUMHANSL_MAJOR: [f64; PITCH_CLASSES] = [
    6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
];

/// Ranks rotations by how well the query's global chroma histogram
/// correlates with a reference profile.
#[derive(Debug, Clone)]
pub struct ProfileEstimator {
    reference: [f64; PITCH_CLASSES],
}

impl Default for ProfileEstimator {
    fn default() -> Self {
        Self {
            reference: KRUMHANSL_MAJOR,
        }
    }
}

impl ProfileEstimator {
    /// Use a corpus-level profile (e.g. the mean chroma of the index).
    pub fn with_reference(reference: [f64; PITCH_CLASSES]) -> Self {
        Self { reference }
    }

    pub fn reference(&self) -> &[f64; PITCH_CLASSES] {
        &self.reference
    }

    /// Correlation of the histogram rotated by each of the 12 shifts.
    pub fn rotation_scores(&self, matrix: &[ChromaVector]) -> [f64; PITCH_CLASSES] {
        let hist = chroma_histogram(matrix);
        std::array::from_fn(|k| {
            let mut rotated = [0.0; PITCH_CLASSES];
            for (i, &h) in hist.iter().enumerate() {
                rotated[(i + k) % PITCH_CLASSES] = h;
            }
            pearson(&rotated, &self.reference)
        })
    }
}

impl TranspositionEstimator for ProfileEstimator {
    fn find_key(&self, matrix: &[ChromaVector], k: usize) -> Vec<TranspositionKey> {
        let k = k.min(PITCH_CLASSES);
        if matrix.is_empty() || k == 0 {
            return vec![0];
        }

        let scores = self.rotation_scores(matrix);
        let mut keys: Vec<usize> = (0..PITCH_CLASSES).collect();
        keys.sort_by(|&a, &b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });

        log::debug!(
            "Transposition candidates: {:?}",
            keys.iter()
                .take(k)
                .map(|&key| (key, scores[key]))
                .collect::<Vec<_>>()
        );

        keys.into_iter().take(k).map(|key| key as TranspositionKey).collect()
    }
}

/// Content-independent candidates, closest shifts first: 0, +1, -1, +2, ...
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestShiftsEstimator;

const NEAREST_SHIFTS: [TranspositionKey; PITCH_CLASSES] = [0, 1, 11, 2, 10, 3, 9, 4, 8, 5, 7, 6];

impl TranspositionEstimator for NearestShiftsEstimator {
    fn find_key(&self, _matrix: &[ChromaVector], k: usize) -> Vec<TranspositionKey> {
        NEAREST_SHIFTS[..k.clamp(1, PITCH_CLASSES)].to_vec()
    }
}

/// Sum of unit-normalized frames. Zero-energy frames contribute nothing.
pub fn chroma_histogram(matrix: &[ChromaVector]) -> [f64; PITCH_CLASSES] {
    let mut hist = [0.0; PITCH_CLASSES];
    for v in matrix {
        for (h, &b) in hist.iter_mut().zip(v.normalized().bins()) {
            *h += b as f64;
        }
    }
    hist
}

/// Pearson correlation; 0 when either side has no variance.
fn pearson(a: &[f64; PITCH_CLASSES], b: &[f64; PITCH_CLASSES]) -> f64 {
    let n = PITCH_CLASSES as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for i in 0..PITCH_CLASSES {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        dot += da * db;
        norm_a += da * da;
        norm_b += db * db;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 { 0.0 } else { dot / denom }
}
