use std::collections::HashSet;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use walkdir::WalkDir;

use crate::SUPPORTED_EXTENSIONS;
use crate::audio::{DecodeError, open_audio};
use crate::chroma::codec::{HashStream, hash_matrix};
use crate::chroma::{ChromaExtractor, ExtractError, PITCH_CLASSES};
use crate::index::{IndexError, IndexWriter};
use crate::transposition::chroma_histogram;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),
    #[error("Index error: {0}")]
    Index(#[from] IndexError),
    #[error("Thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("Progress template error: {0}")]
    Template(#[from] indicatif::style::TemplateError),
    #[error("No song name in {0}")]
    NoTitle(PathBuf),
}

pub struct IndexResult {
    pub found: u64,
    pub indexed: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// A song ready to be written: its hash stream and chroma histogram.
struct SongHashes {
    title: String,
    hashes: HashStream,
    histogram: [f64; PITCH_CLASSES],
}

/// Collect supported audio files under `paths`, sorted for stable ordering.
pub fn find_audio_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        for entry in WalkDir::new(path).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let ext = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files
}

/// Song identifier for a file: its stem.
pub fn song_title(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

/// Index every audio file under `paths`.
///
/// Files are hashed in parallel in chunks of `workers * 2` and written from
/// this thread, so a crash leaves every finished chunk in the index. Songs
/// already present are skipped unless `force`.
pub fn index_paths(
    writer: &IndexWriter,
    paths: &[PathBuf],
    extractor: &ChromaExtractor,
    workers: usize,
    force: bool,
) -> Result<IndexResult, IndexerError> {
    let existing: HashSet<String> = if force {
        HashSet::new()
    } else {
        writer
            .database()
            .list_songs()
            .map_err(IndexError::from)?
            .into_iter()
            .map(|s| s.title)
            .collect()
    };

    let files = find_audio_files(paths);
    let found = files.len() as u64;
    let todo: Vec<PathBuf> = files
        .into_iter()
        .filter(|f| song_title(f).is_some_and(|t| !existing.contains(&t)))
        .collect();
    let skipped = found - todo.len() as u64;

    let mut result = IndexResult {
        found,
        indexed: 0,
        skipped,
        failed: 0,
    };
    if todo.is_empty() {
        log::info!("Nothing to index ({} files found, {} already indexed)", found, skipped);
        return Ok(result);
    }

    let workers = workers.max(1);
    log::info!("Indexing {} files with {} workers ({})", todo.len(), workers, writer.params());

    let pb = ProgressBar::new(todo.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;
    let params = *writer.params();

    for chunk in todo.chunks(workers * 2) {
        let hashed: Vec<_> = pool.install(|| {
            use rayon::prelude::*;
            chunk
                .par_iter()
                .map(|path| {
                    let song = hash_file(path, extractor, params.nranks, params.min_kurtosis);
                    pb.inc(1);
                    (path, song)
                })
                .collect()
        });

        for (path, song) in hashed {
            match song {
                Ok(song) => match store(writer, &song) {
                    Ok(()) => result.indexed += 1,
                    Err(e) => {
                        log::error!("Failed to store {}: {}", song.title, e);
                        result.failed += 1;
                    }
                },
                Err(e) => {
                    log::warn!("Skipping {}: {}", path.display(), e);
                    result.failed += 1;
                }
            }
        }

        pb.set_message(format!("{} indexed, {} failed", result.indexed, result.failed));
    }

    pb.finish_with_message(format!("Done: {} indexed, {} failed", result.indexed, result.failed));
    Ok(result)
}

fn hash_file(
    path: &Path,
    extractor: &ChromaExtractor,
    nranks: u32,
    min_kurtosis: f64,
) -> Result<SongHashes, IndexerError> {
    let title = song_title(path).ok_or_else(|| IndexerError::NoTitle(path.to_path_buf()))?;
    let mut source = open_audio(path)?;
    let matrix = extractor.extract(source.as_mut())?;
    log::debug!("{}: {} chroma frames", title, matrix.len());
    Ok(SongHashes {
        title,
        hashes: hash_matrix(&matrix, nranks, min_kurtosis),
        histogram: chroma_histogram(&matrix),
    })
}

fn store(writer: &IndexWriter, song: &SongHashes) -> Result<(), IndexError> {
    writer.add_song(&song.title, &song.hashes, Some(&song.histogram))?;
    Ok(())
}
