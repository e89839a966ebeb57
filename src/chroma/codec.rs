//! Text formats for chroma matrices and hash streams, and conversion of a
//! chroma matrix into one hash stream per transposition candidate.

use std::io::{BufRead, Write};
use thiserror::Error;

use super::vector::{ChromaMatrix, ChromaVector, EXCLUDED, Hash, PITCH_CLASSES};
use crate::transposition::TranspositionKey;

/// One hash per chroma frame, in temporal order. `EXCLUDED` marks gated frames.
pub type HashStream = Vec<Hash>;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Subsampling stride must be at least 1")]
    ZeroStride,
}

/// Row accounting for a parsed chroma matrix.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParseStats {
    pub lines: usize,
    pub kept: usize,
    pub subsampled: usize,
    pub malformed: usize,
    pub zero_energy: usize,
}

/// Read a chroma matrix, one comma-separated frame per line.
///
/// Only lines at indices `0, stride, 2*stride, ...` are considered. Lines
/// that don't hold exactly 12 finite numbers, and frames whose energy sum is
/// not positive, are skipped.
pub fn parse_chroma_matrix<R: BufRead>(
    reader: R,
    stride: usize,
) -> Result<(ChromaMatrix, ParseStats), CodecError> {
    if stride == 0 {
        return Err(CodecError::ZeroStride);
    }

    let mut matrix = ChromaMatrix::new();
    let mut stats = ParseStats::default();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        stats.lines += 1;

        if line_num % stride != 0 {
            stats.subsampled += 1;
            continue;
        }

        match parse_row(&line) {
            Some(v) if v.energy() > 0.0 => {
                matrix.push(v);
                stats.kept += 1;
            }
            Some(_) => stats.zero_energy += 1,
            None => {
                log::trace!("Skipping malformed chroma row {}: {:?}", line_num, line);
                stats.malformed += 1;
            }
        }
    }

    if stats.malformed > 0 || stats.zero_energy > 0 {
        log::debug!(
            "Chroma matrix: kept {} rows, skipped {} malformed, {} zero-energy",
            stats.kept,
            stats.malformed,
            stats.zero_energy
        );
    }

    Ok((matrix, stats))
}

/// Convenience wrapper over [`parse_chroma_matrix`] for in-memory text.
pub fn parse_chroma_text(text: &str, stride: usize) -> Result<ChromaMatrix, CodecError> {
    parse_chroma_matrix(text.as_bytes(), stride).map(|(m, _)| m)
}

/// Keep every `stride`-th frame of an already decoded matrix, the same
/// selection [`parse_chroma_matrix`] makes on lines.
pub fn subsample(matrix: ChromaMatrix, stride: usize) -> Result<ChromaMatrix, CodecError> {
    match stride {
        0 => Err(CodecError::ZeroStride),
        1 => Ok(matrix),
        _ => Ok(matrix.into_iter().step_by(stride).collect()),
    }
}

fn parse_row(line: &str) -> Option<ChromaVector> {
    let mut values = [0.0_f32; PITCH_CLASSES];
    let mut count = 0;

    for token in line.trim().split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if count == PITCH_CLASSES {
            return None;
        }
        let v: f32 = token.parse().ok()?;
        if !v.is_finite() {
            return None;
        }
        values[count] = v;
        count += 1;
    }

    (count == PITCH_CLASSES).then(|| ChromaVector::new(values))
}

/// Write a chroma matrix in the format read by [`parse_chroma_matrix`].
pub fn write_chroma_matrix<W: Write>(matrix: &[ChromaVector], mut writer: W) -> Result<(), CodecError> {
    for v in matrix {
        let row: Vec<String> = v.bins().iter().map(|b| b.to_string()).collect();
        writeln!(writer, "{}", row.join(","))?;
    }
    writer.flush()?;
    Ok(())
}

/// Hash every frame: `EXCLUDED` below the kurtosis gate, else its rank hash.
pub fn hash_matrix(matrix: &[ChromaVector], nranks: u32, min_kurtosis: f64) -> HashStream {
    matrix
        .iter()
        .map(|v| {
            if v.kurtosis() < min_kurtosis {
                EXCLUDED
            } else {
                v.rank_representation(nranks)
            }
        })
        .collect()
}

/// One hash stream per candidate key, rotating `matrix` in place.
///
/// Candidate `j` is reached from candidate `j - 1` by rotating the shared
/// matrix by the difference of their keys, and is hashed right after that
/// rotation. The passes are therefore strictly sequential, and on return
/// the matrix is left rotated by the last key.
pub fn to_hash_streams(
    matrix: &mut [ChromaVector],
    keys: &[TranspositionKey],
    nranks: u32,
    min_kurtosis: f64,
) -> Vec<HashStream> {
    let mut streams = Vec::with_capacity(keys.len());
    let mut applied: TranspositionKey = 0;

    for &key in keys {
        let delta = (key - applied).rem_euclid(PITCH_CLASSES as TranspositionKey);
        if delta != 0 {
            for v in matrix.iter_mut() {
                v.rotate(delta);
            }
        }
        applied = key;
        streams.push(hash_matrix(matrix, nranks, min_kurtosis));
    }

    streams
}

/// Write a hash stream as whitespace-separated integers and flush.
pub fn write_hash_stream<W: Write>(stream: &[Hash], mut writer: W) -> Result<(), CodecError> {
    let mut line = String::with_capacity(stream.len() * 8);
    for h in stream {
        line.push_str(&h.to_string());
        line.push(' ');
    }
    writeln!(writer, "{}", line.trim_end())?;
    writer.flush()?;
    Ok(())
}

/// Hash every candidate and write each stream to its own writer.
pub fn hash_streams_to_writers<W: Write>(
    matrix: &mut [ChromaVector],
    keys: &[TranspositionKey],
    nranks: u32,
    min_kurtosis: f64,
    writers: &mut [W],
) -> Result<(), CodecError> {
    let streams = to_hash_streams(matrix, keys, nranks, min_kurtosis);
    for (stream, writer) in streams.iter().zip(writers.iter_mut()) {
        write_hash_stream(stream, writer)?;
    }
    Ok(())
}

/// Parse whitespace-separated hashes. Returns the stream and the number of
/// tokens that were skipped because they weren't integers.
pub fn parse_hash_stream(text: &str) -> (HashStream, usize) {
    let mut skipped = 0;
    let stream = text
        .split_whitespace()
        .filter_map(|tok| match tok.parse::<Hash>() {
            Ok(h) if h >= EXCLUDED => Some(h),
            _ => {
                skipped += 1;
                None
            }
        })
        .collect();
    if skipped > 0 {
        log::debug!("Skipped {} malformed hash tokens", skipped);
    }
    (stream, skipped)
}
