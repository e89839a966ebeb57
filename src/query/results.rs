use serde::Serialize;
use std::collections::HashMap;

use crate::transposition::TranspositionKey;

/// What one transposition pipeline produced.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    pub attempt: usize,
    pub key: TranspositionKey,
    /// Per-song geometric mean over the pipeline's segments.
    pub scores: HashMap<String, f64>,
    pub segments: usize,
    pub considered_hashes: u64,
    pub pruned_hashes: u64,
}

/// A transposition attempt that did not contribute to the results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineFailure {
    pub attempt: usize,
    pub key: Option<TranspositionKey>,
    pub message: String,
}

/// Final outcome of a query. Immutable once built.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResults {
    scores: HashMap<String, f64>,
    pruned_hashes: u64,
    considered_hashes: u64,
    failures: Vec<PipelineFailure>,
    timed_out: bool,
}

/// Per-song max of `from` into `into`.
pub fn merge_max(into: &mut HashMap<String, f64>, from: &HashMap<String, f64>) {
    for (song, &score) in from {
        into.entry(song.clone())
            .and_modify(|s| *s = s.max(score))
            .or_insert(score);
    }
}

impl QueryResults {
    /// Merge successful pipelines (max per song, counters summed) and attach
    /// the failures.
    pub fn collect(
        outputs: &[PipelineOutput],
        mut failures: Vec<PipelineFailure>,
        timed_out: bool,
    ) -> Self {
        let mut results = Self {
            timed_out,
            ..Default::default()
        };
        for out in outputs {
            merge_max(&mut results.scores, &out.scores);
            results.pruned_hashes += out.pruned_hashes;
            results.considered_hashes += out.considered_hashes;
        }
        failures.sort_by_key(|f| f.attempt);
        results.failures = failures;
        results
    }

    pub fn scores(&self) -> &HashMap<String, f64> {
        &self.scores
    }

    pub fn score(&self, song: &str) -> Option<f64> {
        self.scores.get(song).copied()
    }

    pub fn pruned_hashes(&self) -> u64 {
        self.pruned_hashes
    }

    pub fn considered_hashes(&self) -> u64 {
        self.considered_hashes
    }

    pub fn failures(&self) -> &[PipelineFailure] {
        &self.failures
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// True when every attempted pipeline contributed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && !self.timed_out
    }

    /// Songs by descending score, ties by song id.
    pub fn ranked(&self) -> Vec<(&str, f64)> {
        let mut ranked: Vec<(&str, f64)> = self
            .scores
            .iter()
            .map(|(song, &score)| (song.as_str(), score))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(attempt: usize, scores: &[(&str, f64)], considered: u64, pruned: u64) -> PipelineOutput {
        PipelineOutput {
            attempt,
            key: attempt as TranspositionKey,
            scores: scores.iter().map(|&(s, v)| (s.to_string(), v)).collect(),
            segments: 1,
            considered_hashes: considered,
            pruned_hashes: pruned,
        }
    }

    #[test]
    fn test_merge_takes_max_per_song() {
        let results = QueryResults::collect(
            &[
                output(0, &[("A", 0.5)], 10, 2),
                output(1, &[("A", 0.8), ("B", 0.3)], 10, 3),
            ],
            Vec::new(),
            false,
        );
        assert_eq!(results.scores().len(), 2);
        assert_eq!(results.score("A"), Some(0.8));
        assert_eq!(results.score("B"), Some(0.3));
        assert_eq!(results.considered_hashes(), 20);
        assert_eq!(results.pruned_hashes(), 5);
        assert!(results.is_complete());
    }

    #[test]
    fn test_merge_is_order_independent() {
        let a = output(0, &[("A", 0.5), ("C", 0.9)], 1, 0);
        let b = output(1, &[("A", 0.8), ("B", 0.3)], 1, 0);
        let ab = QueryResults::collect(&[a.clone(), b.clone()], Vec::new(), false);
        let ba = QueryResults::collect(&[b, a], Vec::new(), false);
        assert_eq!(ab.scores(), ba.scores());
    }

    #[test]
    fn test_ranked_order_and_ties() {
        let results = QueryResults::collect(
            &[output(0, &[("b", 0.5), ("a", 0.5), ("c", 0.9)], 0, 0)],
            Vec::new(),
            false,
        );
        let ranked: Vec<&str> = results.ranked().into_iter().map(|(s, _)| s).collect();
        assert_eq!(ranked, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_failures_make_results_incomplete() {
        let failure = PipelineFailure {
            attempt: 1,
            key: Some(11),
            message: "index went away".to_string(),
        };
        let results = QueryResults::collect(&[output(0, &[("A", 0.4)], 4, 0)], vec![failure], false);
        assert!(!results.is_complete());
        assert_eq!(results.failures()[0].key, Some(11));
        assert_eq!(results.score("A"), Some(0.4));

        let timed_out = QueryResults::collect(&[], Vec::new(), true);
        assert!(!timed_out.is_complete());
        assert!(timed_out.ranked().is_empty());
    }
}
