//! Static language-pair → engine table. Built once at startup, read-only afterwards.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use super::{LanguageCode, LanguagePair};
use crate::engine::EngineId;

/// Pairs served out of the box, one engine per direction.
const BUILTIN_PAIRS: &[(&str, &str, &str)] = &[
    ("en", "es", "Helsinki-NLP/opus-mt-en-es"),
    ("es", "en", "Helsinki-NLP/opus-mt-es-en"),
    ("en", "fr", "Helsinki-NLP/opus-mt-en-fr"),
    ("fr", "en", "Helsinki-NLP/opus-mt-fr-en"),
    ("en", "de", "Helsinki-NLP/opus-mt-en-de"),
    ("de", "en", "Helsinki-NLP/opus-mt-de-en"),
];

/// On-disk registry format.
#[derive(Debug, Deserialize)]
struct RegistryFile {
    pairs: Vec<RegistryFileEntry>,
}

#[derive(Debug, Deserialize)]
struct RegistryFileEntry {
    source: String,
    target: String,
    engine: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("pair {0} is listed more than once")]
    Duplicate(LanguagePair),
}

#[derive(Debug, Clone, Default)]
pub struct PairRegistry {
    table: HashMap<LanguagePair, EngineId>,
}

impl PairRegistry {
    /// The built-in table.
    pub fn builtin() -> Self {
        Self::from_entries(BUILTIN_PAIRS.iter().map(|&(src, tgt, engine)| {
            (LanguagePair::new(src, tgt), EngineId::from(engine))
        }))
    }

    /// Build from explicit entries. Later duplicates replace earlier ones.
    pub fn from_entries(entries: impl IntoIterator<Item = (LanguagePair, EngineId)>) -> Self {
        Self {
            table: entries.into_iter().collect(),
        }
    }

    /// Load the table from a JSON file: `{"pairs":[{"source","target","engine"}]}`.
    pub fn load_from_file(path: &Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = serde_json::from_str(json)?;
        let mut table = HashMap::with_capacity(file.pairs.len());
        for entry in file.pairs {
            let pair = LanguagePair {
                source: LanguageCode::new(entry.source),
                target: LanguageCode::new(entry.target),
            };
            if table.contains_key(&pair) {
                return Err(RegistryError::Duplicate(pair));
            }
            table.insert(pair, EngineId::new(entry.engine));
        }
        Ok(Self { table })
    }

    /// Engine backing `pair`, or `None` if the pair is unsupported.
    pub fn lookup(&self, pair: &LanguagePair) -> Option<&EngineId> {
        self.table.get(pair)
    }

    /// Supported pairs, sorted.
    pub fn pairs(&self) -> Vec<&LanguagePair> {
        let mut pairs: Vec<_> = self.table.keys().collect();
        pairs.sort();
        pairs
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
