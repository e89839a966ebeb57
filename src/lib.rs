pub mod audio;
pub mod chroma;
pub mod config;
pub mod db;
pub mod index;
pub mod indexer;
pub mod query;
pub mod transposition;

/// Audio file extensions we can decode natively
pub const SUPPORTED_EXTENSIONS: &[&str] = &["wav", "wave", "flac"];

/// Application name for XDG paths
pub const APP_NAME: &str = "chromahash";
