//! Concurrent query over transposition candidates.
//!
//! One producer task turns the query into a chroma matrix, picks the
//! candidate keys and streams one hash stream per key down a bounded channel.
//! Each of the `T` pipelines consumes its stream segment by segment, searches
//! the index and keeps a per-song geometric mean. The join step merges the
//! pipelines that finished and reports the ones that didn't.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

use super::QueryError;
use super::pruning::QueryPruningStrategy;
use super::results::{PipelineFailure, PipelineOutput, QueryResults};
use super::segments::{Segment, SegmentQueryBuilder};
use crate::audio::{SampleSource, open_audio};
use crate::chroma::codec::{parse_chroma_matrix, parse_chroma_text, subsample, to_hash_streams};
use crate::chroma::{ChromaExtractor, ChromaMatrix, CodecError, Hash, PITCH_CLASSES};
use crate::db::models::IndexParams;
use crate::index::IndexHandle;
use crate::transposition::{TranspositionEstimator, TranspositionKey};

#[derive(Debug, Clone)]
pub struct QueryParams {
    /// Hashes per segment; 0 uses the index's segment length.
    pub hps: usize,
    pub overlap: usize,
    /// Quantization levels of the rank hash; 0 uses the index's. Any other
    /// value must match the index.
    pub nranks: u32,
    /// Keep every `subsampling`-th chroma frame.
    pub subsampling: usize,
    /// Transposition attempts when an estimator is supplied.
    pub ntransp: usize,
    /// Kurtosis gate; `None` uses the index's.
    pub min_kurtosis: Option<f64>,
    /// Documents per segment search; 0 means all.
    pub max_results: usize,
    pub timeout: Duration,
    pub extractor: ChromaExtractor,
    /// Chunks buffered per pipeline channel.
    pub channel_capacity: usize,
    /// Hashes per channel message.
    pub chunk_size: usize,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            hps: 0,
            overlap: 0,
            nranks: 0,
            subsampling: 1,
            ntransp: 3,
            min_kurtosis: None,
            max_results: 0,
            timeout: Duration::from_secs(600),
            extractor: ChromaExtractor::default(),
            channel_capacity: 4,
            chunk_size: 1024,
        }
    }
}

/// Where the query's chroma comes from.
pub enum QuerySource {
    /// Chroma matrix text, one frame per line.
    ChromaText(String),
    ChromaFile(PathBuf),
    AudioFile(PathBuf),
    Samples(Box<dyn SampleSource>),
}

impl QuerySource {
    /// `.txt` and `.csv` files are chroma matrices, anything else is audio.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "txt" | "csv" => Self::ChromaFile(path.to_path_buf()),
            _ => Self::AudioFile(path.to_path_buf()),
        }
    }

    /// Decode or parse the source into a chroma matrix keeping every
    /// `stride`-th frame, whichever form the chroma comes in.
    pub fn load(self, extractor: &ChromaExtractor, stride: usize) -> Result<ChromaMatrix, QueryError> {
        match self {
            Self::ChromaText(text) => Ok(parse_chroma_text(&text, stride)?),
            Self::ChromaFile(path) => {
                let file = File::open(&path).map_err(CodecError::Io)?;
                let (matrix, stats) = parse_chroma_matrix(BufReader::new(file), stride)?;
                if stats.malformed + stats.zero_energy > 0 {
                    log::warn!(
                        "{}: skipped {} malformed and {} silent rows",
                        path.display(),
                        stats.malformed,
                        stats.zero_energy
                    );
                }
                log::debug!("Parsed {}: {:?}", path.display(), stats);
                Ok(matrix)
            }
            Self::AudioFile(path) => {
                let mut source = open_audio(&path)?;
                let matrix = extractor.extract(source.as_mut())?;
                log::debug!("Extracted {} frames from {}", matrix.len(), path.display());
                Ok(subsample(matrix, stride)?)
            }
            Self::Samples(mut source) => Ok(subsample(extractor.extract(source.as_mut())?, stride)?),
        }
    }
}

enum StreamMessage {
    /// First message on every channel.
    Key(TranspositionKey),
    Hashes(Vec<Hash>),
}

pub struct QueryOrchestrator {
    index: Arc<IndexHandle>,
}

impl QueryOrchestrator {
    pub fn new(index: Arc<IndexHandle>) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &Arc<IndexHandle> {
        &self.index
    }

    /// Run one query.
    ///
    /// Fails outright only when the query can't be decoded or parsed, the
    /// index is unavailable, or the parameters are invalid. Pipeline failures
    /// and the deadline are reported in the returned [`QueryResults`].
    pub async fn query(
        &self,
        source: QuerySource,
        params: &QueryParams,
        estimator: Option<Arc<dyn TranspositionEstimator>>,
        pruning: Box<dyn QueryPruningStrategy>,
    ) -> Result<QueryResults, QueryError> {
        let deadline = Instant::now() + params.timeout;
        let attempts = match estimator {
            Some(_) => params.ntransp,
            None => 1,
        };
        if attempts == 0 {
            return Err(QueryError::InvalidParams(
                "at least one transposition attempt is required".to_string(),
            ));
        }
        let attempts = if attempts > PITCH_CLASSES {
            log::warn!("Only {} transpositions exist, capping {} attempts", PITCH_CLASSES, attempts);
            PITCH_CLASSES
        } else {
            attempts
        };

        let (params, strategy) = self.open_session(params, pruning).await?;
        let hps = params.hps;
        log::info!(
            "Query: {} attempt(s), hps={} overlap={} nranks={} pruning={}",
            attempts,
            hps,
            params.overlap,
            params.nranks,
            strategy.name()
        );

        let stop = Arc::new(AtomicBool::new(false));
        let keys: Arc<OnceLock<Vec<TranspositionKey>>> = Arc::new(OnceLock::new());

        let mut senders = Vec::with_capacity(attempts);
        let mut pipelines = Vec::with_capacity(attempts);
        for attempt in 0..attempts {
            let (tx, rx) = mpsc::channel(params.channel_capacity.max(1));
            senders.push(tx);
            let pipeline = Pipeline {
                attempt,
                hps,
                overlap: params.overlap,
                max_results: params.max_results,
                index: Arc::clone(&self.index),
                strategy: Arc::clone(&strategy),
                stop: Arc::clone(&stop),
            };
            pipelines.push(tokio::task::spawn_blocking(move || pipeline.run(rx)));
        }

        let timeout = params.timeout;
        let mut producer = {
            let keys = Arc::clone(&keys);
            let stop = Arc::clone(&stop);
            tokio::task::spawn_blocking(move || {
                produce(source, &params, estimator.as_deref(), senders, &keys, &stop)
            })
        };

        let mut timed_out = false;
        match timeout_at(deadline, &mut producer).await {
            Ok(joined) => {
                if let Err(e) = joined? {
                    stop.store(true, Ordering::Relaxed);
                    return Err(e);
                }
            }
            Err(_) => {
                log::warn!("Query timed out while preparing hash streams");
                timed_out = true;
            }
        }

        let keys: Vec<TranspositionKey> = keys.get().cloned().unwrap_or_default();
        let key_of = |attempt: usize| keys.get(attempt).copied();

        let mut outputs = Vec::with_capacity(attempts);
        let mut failures = Vec::new();
        for (attempt, mut handle) in pipelines.into_iter().enumerate() {
            let key = key_of(attempt);
            let waited = if timed_out {
                None
            } else {
                match timeout_at(deadline, &mut handle).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        log::warn!("Query deadline passed waiting for attempt {}", attempt);
                        timed_out = true;
                        None
                    }
                }
            };
            // Past the deadline, attempts that already finished still count
            let joined = match waited {
                Some(joined) => joined,
                None if handle.is_finished() => handle.await,
                None => {
                    failures.push(PipelineFailure {
                        attempt,
                        key,
                        message: format!("timed out after {:?}", timeout),
                    });
                    continue;
                }
            };

            match joined {
                Ok(Ok(Some(output))) => outputs.push(output),
                Ok(Ok(None)) => log::debug!("Attempt {} had no transposition candidate", attempt),
                Ok(Err(e)) => {
                    log::error!("Attempt {} (key {:?}) failed: {}", attempt, key, e);
                    failures.push(PipelineFailure {
                        attempt,
                        key,
                        message: e.to_string(),
                    });
                }
                Err(join) => {
                    log::error!("Attempt {} panicked: {}", attempt, join);
                    failures.push(PipelineFailure {
                        attempt,
                        key,
                        message: join.to_string(),
                    });
                }
            }
        }

        if timed_out {
            stop.store(true, Ordering::Relaxed);
        }

        let results = QueryResults::collect(&outputs, failures, timed_out);
        log::info!(
            "Query done: {} song(s), {}/{} hashes pruned, {} failure(s){}",
            results.scores().len(),
            results.pruned_hashes(),
            results.considered_hashes(),
            results.failures().len(),
            if timed_out { ", timed out" } else { "" }
        );
        Ok(results)
    }

    /// [`query`](Self::query) on a private multi-thread runtime.
    pub fn query_blocking(
        &self,
        source: QuerySource,
        params: &QueryParams,
        estimator: Option<Arc<dyn TranspositionEstimator>>,
        pruning: Box<dyn QueryPruningStrategy>,
    ) -> Result<QueryResults, QueryError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_time()
            .build()
            .map_err(QueryError::Runtime)?;
        let result = runtime.block_on(self.query(source, params, estimator, pruning));
        // Pipelines abandoned at the deadline must not hold up the caller
        runtime.shutdown_background();
        result
    }

    /// Fill the parameters left to the index, validate them and load the
    /// pruning strategy. Touching the index here makes an unavailable index
    /// fatal.
    async fn open_session(
        &self,
        requested: &QueryParams,
        mut pruning: Box<dyn QueryPruningStrategy>,
    ) -> Result<(QueryParams, Arc<dyn QueryPruningStrategy>), QueryError> {
        let index = Arc::clone(&self.index);
        let requested = requested.clone();
        tokio::task::spawn_blocking(move || -> Result<(QueryParams, Arc<dyn QueryPruningStrategy>), QueryError> {
            let docs = index.num_docs()?;
            let params = resolve(requested, &index.params()?)?;
            if pruning.needs_stats() {
                pruning.load(index.corpus_stats()?);
            }
            log::debug!("Index has {} documents", docs);
            Ok((params, Arc::from(pruning)))
        })
        .await?
    }
}

/// Query parameters with the index's defaults applied. Hashes built with
/// another quantization could never match the index, so a conflicting
/// `nranks` is rejected.
fn resolve(mut params: QueryParams, index: &IndexParams) -> Result<QueryParams, QueryError> {
    let invalid = |msg: String| Err(QueryError::InvalidParams(msg));
    if params.hps == 0 {
        params.hps = index.hps;
    }
    match params.nranks {
        0 => params.nranks = index.nranks,
        n if n != index.nranks => {
            return invalid(format!(
                "nranks {} does not match the index, which was built with nranks {}",
                n, index.nranks
            ));
        }
        _ => {}
    }
    params.min_kurtosis = Some(params.min_kurtosis.unwrap_or(index.min_kurtosis));

    IndexParams {
        hps: params.hps,
        overlap: params.overlap,
        nranks: params.nranks,
        min_kurtosis: index.min_kurtosis,
    }
    .validate()
    .map_err(QueryError::InvalidParams)?;
    if params.subsampling == 0 {
        return invalid("subsampling stride must be at least 1".to_string());
    }
    Ok(params)
}

/// Decode the query once and feed every pipeline its hash stream.
fn produce(
    source: QuerySource,
    params: &QueryParams,
    estimator: Option<&dyn TranspositionEstimator>,
    senders: Vec<mpsc::Sender<StreamMessage>>,
    keys_out: &OnceLock<Vec<TranspositionKey>>,
    stop: &AtomicBool,
) -> Result<(), QueryError> {
    let mut matrix = source.load(&params.extractor, params.subsampling)?;
    log::debug!("Query has {} chroma frames", matrix.len());

    let attempts = senders.len();
    let mut keys = match estimator {
        Some(e) => e.find_key(&matrix, attempts),
        None => vec![0],
    };
    keys.truncate(attempts);
    if keys.len() < attempts {
        log::info!("Estimator proposed {} of {} transpositions", keys.len(), attempts);
    }
    keys_out.set(keys.clone()).ok();

    let min_kurtosis = params.min_kurtosis.unwrap_or(f64::NEG_INFINITY);
    let streams = to_hash_streams(&mut matrix, &keys, params.nranks, min_kurtosis);

    // Senders without a key are dropped here, closing those channels
    for ((stream, &key), tx) in streams.iter().zip(&keys).zip(senders) {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        if send_stream(&tx, key, stream, params.chunk_size).is_err() {
            log::debug!("Pipeline for key {} stopped listening", key);
        }
    }
    Ok(())
}

fn send_stream(
    tx: &mpsc::Sender<StreamMessage>,
    key: TranspositionKey,
    stream: &[Hash],
    chunk_size: usize,
) -> Result<(), mpsc::error::SendError<StreamMessage>> {
    tx.blocking_send(StreamMessage::Key(key))?;
    for chunk in stream.chunks(chunk_size.max(1)) {
        tx.blocking_send(StreamMessage::Hashes(chunk.to_vec()))?;
    }
    Ok(())
}

struct Pipeline {
    attempt: usize,
    hps: usize,
    overlap: usize,
    max_results: usize,
    index: Arc<IndexHandle>,
    strategy: Arc<dyn QueryPruningStrategy>,
    stop: Arc<AtomicBool>,
}

impl Pipeline {
    /// Consume one hash stream. `Ok(None)` when the producer had no key for
    /// this attempt, or the query was abandoned.
    fn run(self, mut rx: mpsc::Receiver<StreamMessage>) -> Result<Option<PipelineOutput>, QueryError> {
        let key = match rx.blocking_recv() {
            Some(StreamMessage::Key(key)) => key,
            Some(StreamMessage::Hashes(_)) => {
                log::warn!("Attempt {} received hashes before its key", self.attempt);
                return Ok(None);
            }
            None => return Ok(None),
        };

        let mut searcher = self.index.searcher()?;
        let mut builder = SegmentQueryBuilder::new(self.hps, self.overlap, self.strategy.as_ref());
        let step = self.hps - self.overlap;

        let mut pending: Vec<Hash> = Vec::with_capacity(self.hps * 2);
        let mut segments = 0usize;
        // Per-song sum of ln(score); exp(sum / n) is the geometric mean
        let mut log_sums: HashMap<String, f64> = HashMap::new();

        while let Some(message) = rx.blocking_recv() {
            if self.stop.load(Ordering::Relaxed) {
                return Ok(None);
            }
            let StreamMessage::Hashes(chunk) = message else {
                continue;
            };
            pending.extend_from_slice(&chunk);

            while pending.len() >= self.hps {
                let query = builder.build(&Segment {
                    index: segments,
                    start: segments * step,
                    hashes: &pending[..self.hps],
                });
                if !query.is_empty() {
                    let hits = searcher.search(&query, self.max_results)?;
                    let per_song = self.index.reduce_max_per_song(&hits, searcher.as_mut())?;
                    for (song, score) in per_song {
                        *log_sums.entry(song).or_insert(0.0) += score.ln();
                    }
                }
                segments += 1;
                pending.drain(..step);
            }
        }

        let scores = if segments == 0 {
            HashMap::new()
        } else {
            let n = segments as f64;
            log_sums
                .into_iter()
                .map(|(song, sum)| (song, (sum / n).exp()))
                .collect()
        };

        log::debug!(
            "Attempt {} (key {}): {} segments, {} songs, {}/{} hashes pruned",
            self.attempt,
            key,
            segments,
            scores.len(),
            builder.pruned_hashes(),
            builder.considered_hashes()
        );

        Ok(Some(PipelineOutput {
            attempt: self.attempt,
            key,
            scores,
            segments,
            considered_hashes: builder.considered_hashes(),
            pruned_hashes: builder.pruned_hashes(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chroma::codec::hash_matrix;
    use crate::db::models::IndexParams;
    use crate::index::{
        CorpusStats, DocId, DocScore, IndexError, IndexService, IndexWriter, SegmentSearcher,
    };
    use crate::query::pruning::{DocumentFrequencyPruning, NoPruning};
    use crate::query::segments::WeightedQuery;
    use crate::transposition::NearestShiftsEstimator;
    use std::sync::atomic::AtomicUsize;

    /// Doc 1 belongs to "song" and scores `segment_scores[segment]`.
    struct ScriptedIndex {
        segment_scores: Vec<f64>,
        fail_open_on: Option<usize>,
        delay: Duration,
        /// Only queries holding all of these terms are delayed; empty delays all.
        slow_terms: Vec<Hash>,
        opens: AtomicUsize,
    }

    impl ScriptedIndex {
        fn new(segment_scores: Vec<f64>) -> Self {
            Self {
                segment_scores,
                fail_open_on: None,
                delay: Duration::ZERO,
                slow_terms: Vec::new(),
                opens: AtomicUsize::new(0),
            }
        }
    }

    struct ScriptedSearcher {
        segment_scores: Vec<f64>,
        delay: Duration,
        slow_terms: Vec<Hash>,
    }

    impl SegmentSearcher for ScriptedSearcher {
        fn search(&mut self, query: &WeightedQuery, _max_results: usize) -> Result<Vec<DocScore>, IndexError> {
            let slow = self
                .slow_terms
                .iter()
                .all(|h| query.terms.iter().any(|t| t.hash == *h));
            if slow {
                std::thread::sleep(self.delay);
            }
            let score = self.segment_scores[query.segment % self.segment_scores.len()];
            Ok(vec![DocScore { doc: 1, score }])
        }

        fn song_of(&mut self, doc: DocId) -> Result<String, IndexError> {
            match doc {
                1 => Ok("song".to_string()),
                other => Err(IndexError::UnknownDocument(other)),
            }
        }
    }

    impl IndexService for ScriptedIndex {
        fn open_searcher(&self) -> Result<Box<dyn SegmentSearcher>, IndexError> {
            let call = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_open_on == Some(call) {
                return Err(IndexError::Unavailable("searcher limit reached".to_string()));
            }
            Ok(Box::new(ScriptedSearcher {
                segment_scores: self.segment_scores.clone(),
                delay: self.delay,
                slow_terms: self.slow_terms.clone(),
            }))
        }

        fn params(&self) -> Result<IndexParams, IndexError> {
            Ok(IndexParams {
                hps: 4,
                overlap: 0,
                nranks: 3,
                min_kurtosis: f64::NEG_INFINITY,
            })
        }

        fn num_docs(&self) -> Result<u64, IndexError> {
            Ok(1)
        }

        fn corpus_stats(&self) -> Result<CorpusStats, IndexError> {
            Ok(CorpusStats::new(1, HashMap::new()))
        }
    }

    /// `n` distinct frames with a peak moving through the bins.
    fn chroma_rows(n: usize) -> String {
        (0..n)
            .map(|i| {
                let mut row = [0.1f32; PITCH_CLASSES];
                row[i % PITCH_CLASSES] = 1.0;
                row[(i + 4) % PITCH_CLASSES] = 0.5;
                row.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn orchestrator(index: impl IndexService + 'static) -> QueryOrchestrator {
        QueryOrchestrator::new(Arc::new(IndexHandle::new(index)))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_segment_score_is_unchanged() {
        let orch = orchestrator(ScriptedIndex::new(vec![0.42]));
        let results = orch
            .query(
                QuerySource::ChromaText(chroma_rows(4)),
                &QueryParams::default(),
                None,
                Box::new(NoPruning),
            )
            .await
            .unwrap();

        assert!(results.is_complete());
        assert_eq!(results.scores().len(), 1);
        assert!((results.score("song").unwrap() - 0.42).abs() < 1e-12);
        assert_eq!(results.considered_hashes(), 4);
        assert_eq!(results.pruned_hashes(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_geometric_mean_across_segments() {
        let orch = orchestrator(ScriptedIndex::new(vec![0.25, 1.0]));
        let params = QueryParams {
            chunk_size: 3,
            ..Default::default()
        };
        let results = orch
            .query(QuerySource::ChromaText(chroma_rows(9)), &params, None, Box::new(NoPruning))
            .await
            .unwrap();

        // Two full segments, the ninth frame is a partial tail
        assert!((results.score("song").unwrap() - 0.5).abs() < 1e-12);
        assert_eq!(results.considered_hashes(), 8);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_counters_sum_over_transpositions() {
        let orch = orchestrator(ScriptedIndex::new(vec![0.3]));
        let estimator: Arc<dyn TranspositionEstimator> = Arc::new(NearestShiftsEstimator);
        let results = orch
            .query(
                QuerySource::ChromaText(chroma_rows(4)),
                &QueryParams::default(),
                Some(estimator),
                Box::new(NoPruning),
            )
            .await
            .unwrap();

        assert!(results.is_complete());
        assert_eq!(results.considered_hashes(), 12);
        assert!((results.score("song").unwrap() - 0.3).abs() < 1e-12);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_kurtosis_gate_prunes_everything() {
        let orch = orchestrator(ScriptedIndex::new(vec![0.3]));
        let params = QueryParams {
            min_kurtosis: Some(f64::INFINITY),
            ..Default::default()
        };
        let results = orch
            .query(QuerySource::ChromaText(chroma_rows(8)), &params, None, Box::new(NoPruning))
            .await
            .unwrap();

        assert!(results.scores().is_empty());
        assert_eq!(results.considered_hashes(), 8);
        assert_eq!(results.pruned_hashes(), 8);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_pipeline_is_reported() {
        let mut index = ScriptedIndex::new(vec![0.6]);
        index.fail_open_on = Some(2);
        let orch = orchestrator(index);
        let estimator: Arc<dyn TranspositionEstimator> = Arc::new(NearestShiftsEstimator);
        let results = orch
            .query(
                QuerySource::ChromaText(chroma_rows(4)),
                &QueryParams::default(),
                Some(estimator),
                Box::new(NoPruning),
            )
            .await
            .unwrap();

        assert!(!results.is_complete());
        assert!(!results.timed_out());
        assert_eq!(results.failures().len(), 1);
        assert!(results.failures()[0].key.is_some());
        assert!(results.failures()[0].message.contains("searcher limit"));
        // The two surviving attempts still count
        assert_eq!(results.considered_hashes(), 8);
        assert!((results.score("song").unwrap() - 0.6).abs() < 1e-12);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_returns_partial_results() {
        let mut index = ScriptedIndex::new(vec![0.6]);
        index.delay = Duration::from_millis(800);
        let orch = orchestrator(index);
        let params = QueryParams {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let results = orch
            .query(QuerySource::ChromaText(chroma_rows(4)), &params, None, Box::new(NoPruning))
            .await
            .unwrap();

        assert!(results.timed_out());
        assert!(results.scores().is_empty());
        assert_eq!(results.failures().len(), 1);
        assert_eq!(results.failures()[0].key, Some(0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_keeps_finished_attempts() {
        let text = chroma_rows(4);
        let mut index = ScriptedIndex::new(vec![0.6]);
        index.delay = Duration::from_millis(1500);
        // Only the unrotated stream's segment is slow
        index.slow_terms = hash_matrix(&parse_chroma_text(&text, 1).unwrap(), 3, f64::NEG_INFINITY);
        let orch = orchestrator(index);
        let estimator: Arc<dyn TranspositionEstimator> = Arc::new(NearestShiftsEstimator);
        let params = QueryParams {
            timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let results = orch
            .query(QuerySource::ChromaText(text), &params, Some(estimator), Box::new(NoPruning))
            .await
            .unwrap();

        assert!(results.timed_out());
        assert_eq!(results.failures().len(), 1);
        assert_eq!(results.failures()[0].attempt, 0);
        assert_eq!(results.failures()[0].key, Some(0));
        // Attempts 1 and 2 finished before the deadline
        assert_eq!(results.considered_hashes(), 8);
        assert!((results.score("song").unwrap() - 0.6).abs() < 1e-12);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_audio_frames_are_subsampled() {
        let sr = 16000.0;
        let samples: Vec<f64> = (0..32000)
            .map(|i| (2.0 * std::f64::consts::PI * 440.0 * i as f64 / sr).sin() * 0.5)
            .collect();
        let frames = ChromaExtractor::default()
            .extract(&mut crate::audio::BufferSource::new(samples.clone(), sr as f32))
            .unwrap()
            .len();
        assert!(frames > 4);

        let orch = orchestrator(ScriptedIndex::new(vec![0.5]));
        let considered = |stride: usize| {
            let params = QueryParams {
                hps: 1,
                subsampling: stride,
                ..Default::default()
            };
            let source = QuerySource::Samples(Box::new(crate::audio::BufferSource::new(
                samples.clone(),
                sr as f32,
            )));
            let orch = &orch;
            async move {
                orch.query(source, &params, None, Box::new(NoPruning))
                    .await
                    .unwrap()
                    .considered_hashes()
            }
        };

        assert_eq!(considered(1).await, frames as u64);
        assert_eq!(considered(2).await, frames.div_ceil(2) as u64);
        assert_eq!(considered(3).await, frames.div_ceil(3) as u64);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_audio_is_fatal() {
        let orch = orchestrator(ScriptedIndex::new(vec![0.6]));
        let result = orch
            .query(
                QuerySource::AudioFile(PathBuf::from("/nonexistent/query.wav")),
                &QueryParams::default(),
                None,
                Box::new(NoPruning),
            )
            .await;
        assert!(matches!(result, Err(QueryError::Decode(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_params_are_fatal() {
        let orch = orchestrator(ScriptedIndex::new(vec![0.6]));
        for params in [
            QueryParams { overlap: 4, ..Default::default() },
            QueryParams { nranks: 1, ..Default::default() },
            QueryParams { nranks: 40, ..Default::default() },
            QueryParams { subsampling: 0, ..Default::default() },
        ] {
            let result = orch
                .query(QuerySource::ChromaText(chroma_rows(4)), &params, None, Box::new(NoPruning))
                .await;
            assert!(matches!(result, Err(QueryError::InvalidParams(_))));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_song_cache_shared_across_pipelines() {
        let index = crate::index::tests::fixed_index(
            vec![DocScore { doc: 7, score: 0.5 }],
            &[(7, "shared")],
        );
        let lookups = Arc::clone(&index.lookups);
        let orch = orchestrator(index);
        let estimator: Arc<dyn TranspositionEstimator> = Arc::new(NearestShiftsEstimator);
        let params = QueryParams {
            ntransp: 4,
            ..Default::default()
        };
        let results = orch
            .query(
                QuerySource::ChromaText(chroma_rows(8)),
                &params,
                Some(estimator),
                Box::new(NoPruning),
            )
            .await
            .unwrap();

        assert_eq!(results.score("shared"), Some(0.5));
        assert_eq!(orch.index().cached_songs(), 1);
        // Concurrent misses may race, but never more than once per pipeline
        assert!(lookups.load(Ordering::SeqCst) <= 4);
    }

    #[test]
    fn test_end_to_end_against_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let text = chroma_rows(8);
        let matrix = parse_chroma_text(&text, 1).unwrap();
        {
            let writer = IndexWriter::open(
                &path,
                &IndexParams {
                    hps: 4,
                    overlap: 0,
                    nranks: 3,
                    min_kurtosis: f64::NEG_INFINITY,
                },
            )
            .unwrap();
            writer
                .add_song("target", &hash_matrix(&matrix, 3, f64::NEG_INFINITY), None)
                .unwrap();
            // Out of range for nranks 3, so it can never match
            writer.add_song("other", &[1_000_000; 8], None).unwrap();
        }

        let orch = QueryOrchestrator::new(Arc::new(IndexHandle::open_sqlite(&path).unwrap()));
        let results = orch
            .query_blocking(
                QuerySource::ChromaText(text),
                &QueryParams::default(),
                None,
                Box::new(DocumentFrequencyPruning::new(1.0)),
            )
            .unwrap();

        assert!(results.is_complete());
        let ranked = results.ranked();
        assert_eq!(ranked[0].0, "target");
        assert!(results.score("other").is_none());
    }

    #[test]
    fn test_hash_parameters_follow_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let text = chroma_rows(8);
        let matrix = parse_chroma_text(&text, 1).unwrap();
        {
            let writer = IndexWriter::open(
                &path,
                &IndexParams {
                    hps: 4,
                    overlap: 0,
                    nranks: 4,
                    min_kurtosis: f64::NEG_INFINITY,
                },
            )
            .unwrap();
            writer
                .add_song("target", &hash_matrix(&matrix, 4, f64::NEG_INFINITY), None)
                .unwrap();
        }

        let orch = QueryOrchestrator::new(Arc::new(IndexHandle::open_sqlite(&path).unwrap()));
        let results = orch
            .query_blocking(
                QuerySource::ChromaText(text.clone()),
                &QueryParams::default(),
                None,
                Box::new(NoPruning),
            )
            .unwrap();
        assert!(results.is_complete());
        assert_eq!(results.ranked()[0].0, "target");

        let mismatched = QueryParams {
            nranks: 3,
            ..Default::default()
        };
        let result = orch.query_blocking(QuerySource::ChromaText(text), &mismatched, None, Box::new(NoPruning));
        assert!(matches!(result, Err(QueryError::InvalidParams(ref m)) if m.contains("nranks")));
    }
}
