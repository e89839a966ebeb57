use std::io::Read;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("Unsupported sample depth: {0} bits")]
    UnsupportedBitDepth(u32),
    #[error("WAV decode error: {0}")]
    Wav(#[from] hound::Error),
    #[error("FLAC decode error: {0}")]
    Flac(#[from] claxon::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A mono stream of samples normalized to `[-1, 1]`.
pub trait SampleSource: Send {
    fn sample_rate(&self) -> f32;

    /// Read up to `n` samples. Fewer than `n` means the stream is exhausted.
    fn read_samples(&mut self, n: usize) -> Result<Vec<f64>, DecodeError>;
}

/// Open an audio file as a mono sample source, dispatching on extension.
pub fn open_audio(path: &Path) -> Result<Box<dyn SampleSource>, DecodeError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "wav" | "wave" => Ok(Box::new(open_wav(path)?)),
        "flac" => Ok(Box::new(open_flac(path)?)),
        other => Err(DecodeError::UnsupportedFormat(other.to_string())),
    }
}

type SampleIter = Box<dyn Iterator<Item = Result<f64, DecodeError>> + Send>;

/// Interleaved multi-channel samples downmixed to mono on read.
pub struct InterleavedSource {
    samples: SampleIter,
    channels: usize,
    sample_rate: f32,
}

impl InterleavedSource {
    fn new(samples: SampleIter, channels: usize, sample_rate: f32) -> Self {
        Self {
            samples,
            channels: channels.max(1),
            sample_rate,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

impl SampleSource for InterleavedSource {
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn read_samples(&mut self, n: usize) -> Result<Vec<f64>, DecodeError> {
        let mut out = Vec::with_capacity(n);
        'frames: while out.len() < n {
            let mut acc = 0.0;
            for _ in 0..self.channels {
                match self.samples.next() {
                    Some(s) => acc += s?,
                    // A trailing partial frame is dropped
                    None => break 'frames,
                }
            }
            out.push(acc / self.channels as f64);
        }
        Ok(out)
    }
}

/// Full-scale divisor for a signed integer sample of `bits` bits.
fn int_scale(bits: u32) -> Result<f64, DecodeError> {
    match bits {
        8 | 16 | 24 | 32 => Ok((1u64 << (bits - 1)) as f64),
        other => Err(DecodeError::UnsupportedBitDepth(other)),
    }
}

pub fn open_wav(path: &Path) -> Result<InterleavedSource, DecodeError> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let samples: SampleIter = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = int_scale(spec.bits_per_sample as u32)?;
            Box::new(
                reader
                    .into_samples::<i32>()
                    .map(move |s| s.map(|s| s as f64 / scale).map_err(DecodeError::from)),
            )
        }
        hound::SampleFormat::Float => Box::new(
            reader
                .into_samples::<f32>()
                .map(|s| s.map(|s| s as f64).map_err(DecodeError::from)),
        ),
    };

    log::debug!(
        "WAV {}: {} Hz, {} ch, {} bit",
        path.display(),
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample
    );

    Ok(InterleavedSource::new(
        samples,
        spec.channels as usize,
        spec.sample_rate as f32,
    ))
}

/// FLAC decoded block by block and downmixed to mono.
pub struct FlacSource {
    reader: claxon::FlacReader<std::fs::File>,
    block: claxon::Block,
    /// Next unread sample index within `block`.
    pos: u32,
    scale: f64,
    sample_rate: f32,
    exhausted: bool,
}

impl FlacSource {
    /// Decode the next block into `self.block`. False at end of stream.
    fn next_block(&mut self) -> Result<bool, DecodeError> {
        let buffer = std::mem::replace(&mut self.block, claxon::Block::empty()).into_buffer();
        match self.reader.blocks().read_next_or_eof(buffer)? {
            Some(block) => {
                self.block = block;
                self.pos = 0;
                Ok(true)
            }
            None => {
                self.exhausted = true;
                Ok(false)
            }
        }
    }
}

impl SampleSource for FlacSource {
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn read_samples(&mut self, n: usize) -> Result<Vec<f64>, DecodeError> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if self.pos >= self.block.duration() {
                if self.exhausted || !self.next_block()? {
                    break;
                }
                continue;
            }
            let channels = self.block.channels();
            let sum: i64 = (0..channels)
                .map(|ch| self.block.sample(ch, self.pos) as i64)
                .sum();
            out.push(sum as f64 / channels as f64 / self.scale);
            self.pos += 1;
        }
        Ok(out)
    }
}

pub fn open_flac(path: &Path) -> Result<FlacSource, DecodeError> {
    let reader = claxon::FlacReader::open(path)?;
    let info = reader.streaminfo();
    let scale = int_scale(info.bits_per_sample)?;

    log::debug!(
        "FLAC {}: {} Hz, {} ch, {} bit",
        path.display(),
        info.sample_rate,
        info.channels,
        info.bits_per_sample
    );

    Ok(FlacSource {
        reader,
        block: claxon::Block::empty(),
        pos: 0,
        scale,
        sample_rate: info.sample_rate as f32,
        exhausted: false,
    })
}

/// Raw signed big-endian PCM (8-bit is offset binary) from any reader.
pub struct PcmSource<R> {
    inner: R,
    sample_rate: f32,
    bits: u32,
    channels: usize,
}

impl<R: Read + Send> PcmSource<R> {
    pub fn new(inner: R, sample_rate: f32, bits: u32, channels: usize) -> Result<Self, DecodeError> {
        if !matches!(bits, 8 | 16 | 24 | 32) {
            return Err(DecodeError::UnsupportedBitDepth(bits));
        }
        Ok(Self {
            inner,
            sample_rate,
            bits,
            channels: channels.max(1),
        })
    }

    fn decode(&self, b: &[u8]) -> f64 {
        match self.bits {
            8 => (b[0] as f64 - 128.0) / 128.0,
            16 => i16::from_be_bytes([b[0], b[1]]) as f64 / 32768.0,
            24 => {
                // Sign-extend through the top byte of an i32
                let v = i32::from_be_bytes([b[0], b[1], b[2], 0]) >> 8;
                v as f64 / 8_388_606.0
            }
            _ => i32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64 / 2_147_483_648.0,
        }
    }

    /// Fill `buf` as far as the reader allows; returns bytes read.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize, DecodeError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(k) => filled += k,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }
}

impl<R: Read + Send> SampleSource for PcmSource<R> {
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn read_samples(&mut self, n: usize) -> Result<Vec<f64>, DecodeError> {
        let width = (self.bits / 8) as usize;
        let frame = width * self.channels;
        let mut buf = vec![0u8; n * frame];
        let read = self.read_full(&mut buf)?;

        Ok(buf[..read - read % frame]
            .chunks_exact(frame)
            .map(|f| {
                let sum: f64 = f.chunks_exact(width).map(|s| self.decode(s)).sum();
                sum / self.channels as f64
            })
            .collect())
    }
}

/// Samples already held in memory.
pub struct BufferSource {
    samples: Vec<f64>,
    pos: usize,
    sample_rate: f32,
}

impl BufferSource {
    pub fn new(samples: Vec<f64>, sample_rate: f32) -> Self {
        Self {
            samples,
            pos: 0,
            sample_rate,
        }
    }
}

impl SampleSource for BufferSource {
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn read_samples(&mut self, n: usize) -> Result<Vec<f64>, DecodeError> {
        let end = (self.pos + n).min(self.samples.len());
        let out = self.samples[self.pos..end].to_vec();
        self.pos = end;
        Ok(out)
    }
}
