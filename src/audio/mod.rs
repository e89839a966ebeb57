pub mod decode;

pub use decode::{BufferSource, DecodeError, PcmSource, SampleSource, open_audio};
