use anyhow::{Context, Result};
use chromahash::chroma::codec::{to_hash_streams, write_chroma_matrix, write_hash_stream};
use chromahash::chroma::{ChromaMatrix, MAX_NRANKS};
use chromahash::config::{AppConfig, EstimatorKind, PruningKind, build_estimator};
use chromahash::index::{IndexHandle, IndexWriter, SqliteIndex};
use chromahash::query::{QueryOrchestrator, QueryResults, QuerySource};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "chromahash", version, about = "Cover-song identification with chroma fingerprints")]
struct Cli {
    /// Path to the SQLite index
    #[arg(long, global = true)]
    index: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract a chroma matrix from an audio file
    Chroma {
        /// WAV or FLAC file
        input: PathBuf,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Hash a chroma matrix (or audio file), one stream per transposition
    Hashes {
        /// Chroma matrix (.txt) or audio file
        input: PathBuf,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of transposition attempts
        #[arg(long)]
        ntransp: Option<usize>,

        /// Transposition estimator
        #[arg(long, value_enum)]
        estimator: Option<EstimatorKind>,

        /// Quantization levels of the rank hash (default: the [index] setting)
        #[arg(long)]
        nranks: Option<u32>,

        /// Kurtosis gate; frames below it hash to -1 (default: the [index] setting)
        #[arg(long, allow_hyphen_values = true)]
        min_kurtosis: Option<f64>,

        /// Keep every n-th chroma frame
        #[arg(long)]
        subsampling: Option<usize>,
    },

    /// Add audio files to the index
    Index {
        /// Directories to scan
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Re-index songs that are already in the index
        #[arg(long)]
        force: bool,
    },

    /// Find the indexed songs closest to an audio excerpt or chroma matrix
    Query {
        /// Audio file, or chroma matrix (.txt)
        input: PathBuf,

        /// Hashes per segment (0 = the index's segment length)
        #[arg(long)]
        hps: Option<usize>,

        /// Hashes shared by consecutive segments
        #[arg(long)]
        overlap: Option<usize>,

        /// Number of transposition attempts
        #[arg(long)]
        ntransp: Option<usize>,

        /// Quantization levels of the rank hash (0 = the index's)
        #[arg(long)]
        nranks: Option<u32>,

        /// Keep every n-th chroma frame
        #[arg(long)]
        subsampling: Option<usize>,

        /// Transposition estimator
        #[arg(long, value_enum)]
        estimator: Option<EstimatorKind>,

        /// Term pruning strategy
        #[arg(long, value_enum)]
        pruning: Option<PruningKind>,

        /// Kurtosis gate; frames below it are not queried (default: the index's)
        #[arg(long, allow_hyphen_values = true)]
        min_kurtosis: Option<f64>,

        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Number of songs to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics
    Stats {
        /// Also list every indexed song
        #[arg(long)]
        songs: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = AppConfig::load();

    // Resolve index path: CLI > config > XDG default
    let index_path = cli
        .index
        .or(config.index_path.clone())
        .unwrap_or_else(chromahash::config::default_index_path);
    log::info!("Index: {}", index_path.display());

    match cli.command {
        Commands::Chroma { input, output } => {
            let matrix = extract_chroma(&input, &config)?;
            let writer = open_output(output.as_deref())?;
            write_chroma_matrix(&matrix, writer).context("Failed to write chroma matrix")?;
            log::info!("Wrote {} frames", matrix.len());
        }

        Commands::Hashes {
            input,
            output,
            ntransp,
            estimator,
            nranks,
            min_kurtosis,
            subsampling,
        } => {
            let nranks = nranks.unwrap_or(config.index.nranks);
            if !(2..=MAX_NRANKS).contains(&nranks) {
                anyhow::bail!("nranks must be in 2..={}, got {}", MAX_NRANKS, nranks);
            }
            let q = &config.query;
            let mut matrix = load_matrix(&input, &config, subsampling.unwrap_or(q.subsampling))?;
            let ntransp = ntransp.unwrap_or(q.ntransp);
            let keys = match build_estimator(estimator.unwrap_or(q.estimator), None) {
                Some(est) => est.find_key(&matrix, ntransp),
                None => vec![0],
            };
            let streams = to_hash_streams(
                &mut matrix,
                &keys,
                nranks,
                min_kurtosis.unwrap_or(config.index.min_kurtosis),
            );
            let mut writer = open_output(output.as_deref())?;
            for (key, stream) in keys.iter().zip(&streams) {
                log::info!("Key {}: {} hashes", key, stream.len());
                write_hash_stream(stream, &mut writer).context("Failed to write hash stream")?;
            }
        }

        Commands::Index { paths, jobs, force } => {
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let writer = IndexWriter::open(&index_path, &config.index.params())
                .context("Failed to open index for writing")?;
            let result = chromahash::indexer::index_paths(
                &writer,
                &paths,
                &config.extraction.extractor(),
                workers,
                force,
            )
            .context("Indexing failed")?;
            println!(
                "Index complete: {} found, {} indexed, {} skipped, {} failed",
                result.found, result.indexed, result.skipped, result.failed
            );
        }

        Commands::Query {
            input,
            hps,
            overlap,
            ntransp,
            nranks,
            subsampling,
            estimator,
            pruning,
            min_kurtosis,
            timeout,
            limit,
            json,
        } => {
            let q = &config.query;
            let mut params = q.params(&config.extraction);
            params.hps = hps.unwrap_or(params.hps);
            params.overlap = overlap.unwrap_or(params.overlap);
            params.ntransp = ntransp.unwrap_or(params.ntransp);
            params.nranks = nranks.unwrap_or(params.nranks);
            params.subsampling = subsampling.unwrap_or(params.subsampling);
            params.min_kurtosis = min_kurtosis.or(params.min_kurtosis);
            if let Some(secs) = timeout {
                params.timeout = std::time::Duration::from_secs(secs);
            }

            let index = SqliteIndex::open(&index_path).context("Failed to open index")?;
            let estimator_kind = estimator.unwrap_or(q.estimator);
            let profile = if estimator_kind == EstimatorKind::Profile {
                index.chroma_profile().context("Failed to read corpus profile")?
            } else {
                None
            };
            let estimator = build_estimator(estimator_kind, profile);
            let strategy = q.pruning_strategy(pruning.unwrap_or(q.pruning));

            let orchestrator = QueryOrchestrator::new(Arc::new(IndexHandle::new(index)));
            let results = orchestrator
                .query_blocking(QuerySource::from_path(&input), &params, estimator, strategy)
                .with_context(|| format!("Query failed for {}", input.display()))?;

            if json {
                print_results_json(&results, limit)?;
            } else {
                print_results_table(&results, limit);
            }
        }

        Commands::Stats { songs } => {
            let db = chromahash::db::Database::open_read_only(&index_path)
                .context("Failed to open index")?;
            let stats = db.stats()?;
            println!("Songs:          {}", stats.songs);
            println!("Segments:       {}", stats.segments);
            println!("Postings:       {}", stats.postings);
            println!("Distinct terms: {}", stats.distinct_terms);
            match stats.params {
                Some(p) => println!("Parameters:     {}", p),
                None => println!("Parameters:     (not set, index is empty)"),
            }

            if songs {
                println!();
                println!("{:<50} {:>8} {:>8}", "Song", "Frames", "Segments");
                println!("{}", "-".repeat(68));
                for s in db.list_songs()? {
                    println!("{:<50} {:>8} {:>8}", truncate(&s.title, 50), s.frames, s.segments);
                }
            }
        }
    }

    Ok(())
}

fn extract_chroma(path: &Path, config: &AppConfig) -> Result<ChromaMatrix> {
    let mut source = chromahash::audio::open_audio(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    config
        .extraction
        .extractor()
        .extract(source.as_mut())
        .with_context(|| format!("Chroma extraction failed for {}", path.display()))
}

/// Chroma matrix from a `.txt` file or extracted from audio, subsampled the
/// same way a query would be.
fn load_matrix(path: &Path, config: &AppConfig, subsampling: usize) -> Result<ChromaMatrix> {
    QuerySource::from_path(path)
        .load(&config.extraction.extractor(), subsampling)
        .with_context(|| format!("Failed to load chroma from {}", path.display()))
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(p) => Box::new(std::io::BufWriter::new(
            std::fs::File::create(p).with_context(|| format!("Failed to create {}", p.display()))?,
        )),
        None => Box::new(std::io::stdout().lock()),
    })
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() > width {
        let head: String = s.chars().take(width - 3).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

/// Print the top songs with their scores.
fn print_results_table(results: &QueryResults, limit: usize) {
    println!("{:>4}  {:<50} {:>10}", "#", "Song", "Score");
    println!("{}", "-".repeat(66));

    for (i, (song, score)) in results.ranked().into_iter().take(limit).enumerate() {
        println!("{:>4}  {:<50} {:>10.6}", i + 1, truncate(song, 50), score);
    }

    println!();
    println!(
        "{} song(s) matched, {} of {} hashes pruned",
        results.scores().len(),
        results.pruned_hashes(),
        results.considered_hashes()
    );
    for f in results.failures() {
        let key = f.key.map(|k| k.to_string()).unwrap_or_else(|| "?".to_string());
        eprintln!("warning: attempt {} (key {}) failed: {}", f.attempt, key, f.message);
    }
    if results.timed_out() {
        eprintln!("warning: query timed out, results are partial");
    }
}

fn print_results_json(results: &QueryResults, limit: usize) -> Result<()> {
    let ranked: Vec<_> = results
        .ranked()
        .into_iter()
        .take(limit)
        .map(|(song, score)| serde_json::json!({ "song": song, "score": score }))
        .collect();
    let report = serde_json::json!({
        "results": ranked,
        "pruned_hashes": results.pruned_hashes(),
        "considered_hashes": results.considered_hashes(),
        "failures": results.failures(),
        "timed_out": results.timed_out(),
        "complete": results.is_complete(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
