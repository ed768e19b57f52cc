//! Error types for graph construction, the cache registry and the audio calculator.
//!
//! Only configuration problems are errors. A frame that is not ready yet
//! (nudger timeout, cache miss) or an upstream decode failure is reported as
//! `Ok(None)` by `Source::fetch`.

use thiserror::Error;

/// Errors raised while wiring, syncing or fetching from a graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("{stage}: nothing connected on slot {slot}")]
    NotConnected { stage: &'static str, slot: usize },

    #[error("{stage}: slot {slot} is out of range (stage has {count} slots)")]
    InvalidSlot {
        stage: &'static str,
        slot: usize,
        count: usize,
    },

    #[error("{stage}: unable to obtain frame {position}")]
    NoFrame { stage: &'static str, position: i32 },

    #[error("{stage}: unknown option '{key}'")]
    UnknownOption { stage: &'static str, key: String },

    #[error("{stage}: invalid value {value} for option '{key}'")]
    InvalidOption {
        stage: &'static str,
        key: String,
        value: i64,
    },

    #[error("{stage}: stage cannot be duplicated")]
    NotDuplicable { stage: &'static str },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors raised by [`crate::core::CacheRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("cache scope '{0}' already exists")]
    ScopeExists(String),

    #[error("cache scope '{0}' does not exist")]
    UnknownScope(String),
}

/// Errors raised by the stream registry of [`crate::audio::Calculator`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimingError {
    #[error("stream {index} of '{source_name}': only video and audio streams can be registered")]
    UnsupportedStream { index: usize, source_name: String },

    #[error("stream {index} of '{source_name}' was never registered")]
    UnregisteredStream { index: usize, source_name: String },

    #[error("stream {index} of '{source_name}' has an unknown type")]
    UnknownStream { index: usize, source_name: String },
}

pub type GraphResult<T> = Result<T, GraphError>;
