use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::chroma::ChromaExtractor;
use crate::db::models::IndexParams;
use crate::query::{DocumentFrequencyPruning, NoPruning, QueryParams, QueryPruningStrategy};
use crate::transposition::{NearestShiftsEstimator, ProfileEstimator, TranspositionEstimator};

/// Application configuration loaded from TOML config file.
/// All fields have defaults, the config file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Custom index path (overrides XDG default).
    pub index_path: Option<PathBuf>,
    /// Number of parallel indexing workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    pub extraction: ExtractionConfig,
    pub query: QueryConfig,
    pub index: IndexConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub window_ms: f64,
    pub hopsize_ratio: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        let d = ChromaExtractor::default();
        Self {
            window_ms: d.window_ms,
            hopsize_ratio: d.hopsize_ratio,
        }
    }
}

impl ExtractionConfig {
    pub fn extractor(&self) -> ChromaExtractor {
        ChromaExtractor::new(self.window_ms, self.hopsize_ratio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PruningKind {
    None,
    DocumentFrequency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EstimatorKind {
    None,
    /// Correlate against a key profile
    Profile,
    /// Nearest semitone shifts, no analysis
    Nearest,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// 0 = use the index's segment length.
    pub hps: usize,
    pub overlap: usize,
    /// 0 = use the index's.
    pub nranks: u32,
    pub subsampling: usize,
    pub ntransp: usize,
    /// Unset = use the index's.
    pub min_kurtosis: Option<f64>,
    pub max_results: usize,
    pub timeout_secs: u64,
    pub pruning: PruningKind,
    pub max_df_ratio: f64,
    pub estimator: EstimatorKind,
}

impl Default for QueryConfig {
    fn default() -> Self {
        let d = QueryParams::default();
        Self {
            hps: d.hps,
            overlap: d.overlap,
            nranks: d.nranks,
            subsampling: d.subsampling,
            ntransp: d.ntransp,
            min_kurtosis: d.min_kurtosis,
            max_results: d.max_results,
            timeout_secs: d.timeout.as_secs(),
            pruning: PruningKind::None,
            max_df_ratio: 0.5,
            estimator: EstimatorKind::None,
        }
    }
}

impl QueryConfig {
    pub fn params(&self, extraction: &ExtractionConfig) -> QueryParams {
        QueryParams {
            hps: self.hps,
            overlap: self.overlap,
            nranks: self.nranks,
            subsampling: self.subsampling,
            ntransp: self.ntransp,
            min_kurtosis: self.min_kurtosis,
            max_results: self.max_results,
            timeout: std::time::Duration::from_secs(self.timeout_secs),
            extractor: extraction.extractor(),
            ..Default::default()
        }
    }

    pub fn pruning_strategy(&self, kind: PruningKind) -> Box<dyn QueryPruningStrategy> {
        match kind {
            PruningKind::None => Box::new(NoPruning),
            PruningKind::DocumentFrequency => Box::new(DocumentFrequencyPruning::new(self.max_df_ratio)),
        }
    }
}

/// Build the estimator for `kind`. A profile estimator uses `corpus_profile`
/// when one is available.
pub fn build_estimator(
    kind: EstimatorKind,
    corpus_profile: Option<[f64; crate::chroma::PITCH_CLASSES]>,
) -> Option<std::sync::Arc<dyn TranspositionEstimator>> {
    match kind {
        EstimatorKind::None => None,
        EstimatorKind::Nearest => Some(std::sync::Arc::new(NearestShiftsEstimator)),
        EstimatorKind::Profile => Some(std::sync::Arc::new(match corpus_profile {
            Some(profile) => ProfileEstimator::with_reference(profile),
            None => ProfileEstimator::default(),
        })),
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub hps: usize,
    pub overlap: usize,
    pub nranks: u32,
    pub min_kurtosis: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            hps: 100,
            overlap: 50,
            nranks: 3,
            min_kurtosis: f64::NEG_INFINITY,
        }
    }
}

impl IndexConfig {
    pub fn params(&self) -> IndexParams {
        IndexParams {
            hps: self.hps,
            overlap: self.overlap,
            nranks: self.nranks,
            min_kurtosis: self.min_kurtosis,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/chromahash/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default index path using XDG data directory.
pub fn default_index_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("index.db")
    } else {
        // Fallback: current directory
        PathBuf::from("chromahash-index.db")
    }
}
