//! Translation engine abstraction: one loaded model + tokenizer per engine id.
//! Engines are immutable once constructed and shared across worker threads.

pub mod lexicon;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use lexicon::{LexiconEngine, LexiconLoader};

/// Opaque identifier of a concrete engine (e.g. a model name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineId(String);

impl EngineId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EngineId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Tokenized input: engine-specific ids plus the surface pieces they came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Encoding {
    pub ids: Vec<u32>,
    pub pieces: Vec<String>,
}

impl Encoding {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Keep at most `max_tokens` leading tokens.
    pub fn truncate(&mut self, max_tokens: usize) {
        self.ids.truncate(max_tokens);
        self.pieces.truncate(max_tokens);
    }
}

/// Decoding parameters passed explicitly on every call so output is reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationParams {
    /// Upper bound on generated tokens.
    pub max_length: usize,
    /// Beam width of the deterministic search.
    pub num_beams: usize,
    /// Stop as soon as `num_beams` hypotheses have reached a terminal token.
    pub early_stopping: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_length: 512,
            num_beams: 3,
            early_stopping: true,
        }
    }
}

/// A loaded, ready-to-use translation engine.
///
/// Implementations must tolerate concurrent calls through `&self`; an engine
/// wrapping a non-reentrant runtime serializes internally.
pub trait TranslationEngine: Send + Sync {
    fn engine_id(&self) -> &EngineId;

    fn encode(&self, text: &str) -> Result<Encoding, InferenceError>;

    fn generate(
        &self,
        input: &Encoding,
        params: &GenerationParams,
    ) -> Result<Vec<u32>, InferenceError>;

    /// Turn generated ids back into text. `input` is available for copy tokens.
    fn decode(&self, output: &[u32], input: &Encoding) -> Result<String, InferenceError>;
}

/// Constructs engines on cache misses.
pub trait EngineLoader: Send + Sync {
    fn load(&self, id: &EngineId) -> Result<Arc<dyn TranslationEngine>, LoadError>;
}

/// Engine construction failure. Cloned to every caller waiting on the same load.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LoadError {
    #[error("engine {engine_id} not found at {}", path.display())]
    NotFound { engine_id: EngineId, path: PathBuf },
    #[error("engine {engine_id} I/O error: {message}")]
    Io { engine_id: EngineId, message: String },
    #[error("engine {engine_id} data is corrupt: {message}")]
    Corrupt { engine_id: EngineId, message: String },
    #[error("engine {engine_id} load aborted")]
    Aborted { engine_id: EngineId },
}

/// Runtime failure inside tokenize / generate / decode.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    #[error("tokenization failed: {0}")]
    Tokenize(String),
    #[error("generation failed: {0}")]
    Generate(String),
    #[error("decoding failed: {0}")]
    Decode(String),
    #[error("inference cancelled")]
    Cancelled,
}
