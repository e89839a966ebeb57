pub mod codec;
pub mod extract;
pub mod vector;

pub use codec::{CodecError, HashStream, ParseStats};
pub use extract::{ChromaExtractor, ExtractError};
pub use vector::{ChromaMatrix, ChromaVector, EXCLUDED, Hash, MAX_NRANKS, PITCH_CLASSES};
