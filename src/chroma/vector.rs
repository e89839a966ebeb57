/// Number of pitch classes in a chroma vector.
pub const PITCH_CLASSES: usize = 12;

/// An integer fingerprint of one chroma frame.
pub type Hash = i64;

/// Hash value reserved for frames rejected by the kurtosis gate.
pub const EXCLUDED: Hash = -1;

/// Largest quantization level whose hashes fit in a `Hash`.
pub const MAX_NRANKS: u32 = 38;

/// Pitch-class energy of one analysis frame.
///
/// Bin `i` holds the energy folded onto the pitch class `i` semitones above
/// the folding reference (A for extracted frames). The order is meaningful:
/// rotating by one position is a transposition by one semitone.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChromaVector {
    bins: [f32; PITCH_CLASSES],
}

impl ChromaVector {
    pub fn new(bins: [f32; PITCH_CLASSES]) -> Self {
        Self { bins }
    }

    /// Build from a slice, returning `None` unless it has exactly 12 entries.
    pub fn from_slice(values: &[f32]) -> Option<Self> {
        let bins: [f32; PITCH_CLASSES] = values.try_into().ok()?;
        Some(Self { bins })
    }

    pub fn bins(&self) -> &[f32; PITCH_CLASSES] {
        &self.bins
    }

    /// Total energy across all pitch classes.
    pub fn energy(&self) -> f64 {
        self.bins.iter().map(|&b| b as f64).sum()
    }

    /// Cyclically shift the bins by `k` semitones in place.
    ///
    /// Negative shifts are allowed; the shift is taken mod 12, so rotations
    /// compose additively.
    pub fn rotate(&mut self, k: i32) {
        let k = k.rem_euclid(PITCH_CLASSES as i32) as usize;
        self.bins.rotate_right(k);
    }

    /// Kurtosis (fourth standardized moment) of the 12 energies.
    ///
    /// High values mean energy concentrated in few pitch classes; a flat
    /// vector has no peak at all and reports `NEG_INFINITY` so that every
    /// finite quality gate rejects it.
    pub fn kurtosis(&self) -> f64 {
        let n = PITCH_CLASSES as f64;
        let mean = self.energy() / n;

        let mut m2 = 0.0_f64;
        let mut m4 = 0.0_f64;
        for &b in &self.bins {
            let d = b as f64 - mean;
            let d2 = d * d;
            m2 += d2;
            m4 += d2 * d2;
        }
        m2 /= n;
        m4 /= n;

        if m2 <= f64::EPSILON * mean.abs().max(1.0) {
            return f64::NEG_INFINITY;
        }
        m4 / (m2 * m2)
    }

    /// Rank-based hash at quantization level `nranks`.
    ///
    /// Bins are ranked by decreasing energy (ties broken by lower pitch class).
    /// The strongest `nranks - 1` bins get levels `0..nranks-1` in rank order
    /// and every remaining bin shares level `nranks - 1`. The levels are read
    /// as a 12-digit base-`nranks` number, bin 0 least significant, so the
    /// result lies in `[0, nranks^12)`.
    ///
    /// Only the relative order of the bins matters, so any positive rescaling
    /// of the vector yields the same hash. `nranks` must be at least 1 and
    /// small enough for `nranks^12` to fit in an `i64` (at most 38).
    pub fn rank_representation(&self, nranks: u32) -> Hash {
        debug_assert!((1..=MAX_NRANKS).contains(&nranks));
        let base = nranks as Hash;
        let top = nranks.saturating_sub(1) as usize;

        let mut order: [usize; PITCH_CLASSES] = std::array::from_fn(|i| i);
        order.sort_by(|&a, &b| {
            self.bins[b]
                .partial_cmp(&self.bins[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut levels = [top as Hash; PITCH_CLASSES];
        for (rank, &bin) in order.iter().enumerate().take(top) {
            levels[bin] = rank as Hash;
        }

        levels.iter().rev().fold(0, |acc, &level| acc * base + level)
    }

    /// Copy of this vector scaled to unit sum. Zero-energy vectors stay zero.
    pub fn normalized(&self) -> Self {
        let total = self.energy();
        if total <= 0.0 {
            return *self;
        }
        let mut out = *self;
        for b in &mut out.bins {
            *b = (*b as f64 / total) as f32;
        }
        out
    }
}

impl From<[f32; PITCH_CLASSES]> for ChromaVector {
    fn from(bins: [f32; PITCH_CLASSES]) -> Self {
        Self::new(bins)
    }
}

/// Ordered sequence of chroma frames.
pub type ChromaMatrix = Vec<ChromaVector>;
