use std::collections::{BTreeMap, HashSet};

use super::pruning::QueryPruningStrategy;
use crate::chroma::{EXCLUDED, Hash};

/// A fixed-length window over a hash stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub index: usize,
    pub start: usize,
    pub hashes: &'a [Hash],
}

/// One term of a weighted query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedTerm {
    pub hash: Hash,
    pub weight: f32,
}

/// The terms sent to the index for one segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightedQuery {
    pub segment: usize,
    pub terms: Vec<WeightedTerm>,
}

impl WeightedQuery {
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Windows of `hps` hashes, each starting `hps - overlap` after the previous
/// one. A trailing window shorter than `hps` is dropped.
///
/// Callers must ensure `overlap < hps`.
pub fn segments(stream: &[Hash], hps: usize, overlap: usize) -> impl Iterator<Item = Segment<'_>> {
    let step = hps.saturating_sub(overlap).max(1);
    let count = if hps == 0 || stream.len() < hps {
        0
    } else {
        (stream.len() - hps) / step + 1
    };
    (0..count).map(move |index| {
        let start = index * step;
        Segment {
            index,
            start,
            hashes: &stream[start..start + hps],
        }
    })
}

/// Multiplicity of every non-excluded hash in a segment, in hash order.
pub fn term_counts(hashes: &[Hash]) -> BTreeMap<Hash, u32> {
    let mut counts = BTreeMap::new();
    for &h in hashes {
        if h != EXCLUDED {
            *counts.entry(h).or_insert(0) += 1;
        }
    }
    counts
}

/// Turns a hash stream into per-segment weighted queries, keeping running
/// totals of the hashes it looked at and the ones that didn't make it into
/// a query.
pub struct SegmentQueryBuilder<'s> {
    hps: usize,
    overlap: usize,
    strategy: &'s dyn QueryPruningStrategy,
    considered: u64,
    pruned: u64,
}

impl<'s> SegmentQueryBuilder<'s> {
    pub fn new(hps: usize, overlap: usize, strategy: &'s dyn QueryPruningStrategy) -> Self {
        debug_assert!(overlap < hps);
        Self {
            hps,
            overlap,
            strategy,
            considered: 0,
            pruned: 0,
        }
    }

    pub fn segments<'a>(&self, stream: &'a [Hash]) -> impl Iterator<Item = Segment<'a>> + use<'a> {
        segments(stream, self.hps, self.overlap)
    }

    /// Build the query for one segment and update the counters.
    pub fn build(&mut self, segment: &Segment<'_>) -> WeightedQuery {
        let terms = self.strategy.select(segment.hashes);

        let kept: HashSet<Hash> = terms.iter().map(|t| t.hash).collect();
        let retained = segment.hashes.iter().filter(|h| kept.contains(h)).count();

        self.considered += segment.hashes.len() as u64;
        self.pruned += (segment.hashes.len() - retained) as u64;

        WeightedQuery {
            segment: segment.index,
            terms,
        }
    }

    /// Queries for every full segment of `stream`, in temporal order.
    pub fn build_all(&mut self, stream: &[Hash]) -> Vec<WeightedQuery> {
        let segs: Vec<Segment<'_>> = self.segments(stream).collect();
        segs.iter().map(|s| self.build(s)).collect()
    }

    pub fn considered_hashes(&self) -> u64 {
        self.considered
    }

    pub fn pruned_hashes(&self) -> u64 {
        self.pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::pruning::NoPruning;

    #[test]
    fn test_segment_starts_and_lengths() {
        let stream: Vec<Hash> = (0..10).collect();
        let segs: Vec<_> = segments(&stream, 4, 1).collect();
        // step 3: starts 0, 3, 6; 9 would be short
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].hashes, &[0, 1, 2, 3]);
        assert_eq!(segs[1].hashes, &[3, 4, 5, 6]);
        assert_eq!(segs[2].hashes, &[6, 7, 8, 9]);
        assert_eq!(segs[2].index, 2);
    }

    #[test]
    fn test_no_overlap_drops_partial_tail() {
        let stream: Vec<Hash> = (0..11).collect();
        let segs: Vec<_> = segments(&stream, 5, 0).collect();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[1].start, 5);
    }

    #[test]
    fn test_short_stream_has_no_segments() {
        let stream: Vec<Hash> = vec![1, 2, 3];
        assert_eq!(segments(&stream, 4, 0).count(), 0);
        assert_eq!(segments(&[], 4, 2).count(), 0);
    }

    #[test]
    fn test_exact_length_is_one_segment() {
        let stream: Vec<Hash> = vec![1, 2, 3, 4];
        assert_eq!(segments(&stream, 4, 3).count(), 1);
    }

    #[test]
    fn test_term_counts_skip_excluded() {
        let counts = term_counts(&[5, -1, 5, 7, -1]);
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[&5], 2);
        assert_eq!(counts[&7], 1);
    }

    #[test]
    fn test_builder_counters() {
        let strategy = NoPruning;
        let mut builder = SegmentQueryBuilder::new(4, 2, &strategy);
        let stream = vec![1, -1, 2, 2, 3, -1, 4, 5];
        let queries = builder.build_all(&stream);

        // Segments: [1,-1,2,2] [2,2,3,-1] [3,-1,4,5]
        assert_eq!(queries.len(), 3);
        assert_eq!(builder.considered_hashes(), 12);
        assert_eq!(builder.pruned_hashes(), 3);
        assert!(queries
            .iter()
            .all(|q| q.terms.iter().all(|t| t.hash != EXCLUDED)));
        assert_eq!(
            queries[1].terms,
            vec![
                WeightedTerm { hash: 2, weight: 2.0 },
                WeightedTerm { hash: 3, weight: 1.0 },
            ]
        );
    }

    #[test]
    fn test_counters_never_decrease() {
        let strategy = NoPruning;
        let mut builder = SegmentQueryBuilder::new(3, 0, &strategy);
        let stream = vec![-1, -1, 1, 2, 3, -1, 4, 4, 4];
        let mut last = (0, 0);
        for seg in segments(&stream, 3, 0) {
            builder.build(&seg);
            let now = (builder.considered_hashes(), builder.pruned_hashes());
            assert!(now.0 >= last.0 && now.1 >= last.1);
            last = now;
        }
        assert_eq!(last, (9, 3));
    }
}
