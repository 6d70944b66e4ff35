#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use polyglot_chat::engine::lexicon::LEXICON_FILE;
use polyglot_chat::engine::{EngineId, EngineLoader, LexiconLoader, LoadError, TranslationEngine};

pub const EN_ES: &str = r#"{
    "entries": {
        "hello": [{"text": "hola", "weight": 0.9}],
        "hi": [{"text": "hola", "weight": 1.0}],
        "my": [{"text": "mi", "weight": 1.0}],
        "friend": [{"text": "amigo", "weight": 1.0}],
        "good": [{"text": "bien", "weight": 0.4}, {"text": "bueno", "weight": 0.6}],
        "very": [{"text": "muy", "weight": 0.4}, {"text": "bastante", "weight": 0.6}]
    },
    "bigrams": {"muy bien": 1.0}
}"#;

pub const EN_FR: &str = r#"{
    "entries": {
        "hello": [{"text": "bonjour", "weight": 1.0}],
        "hi": [{"text": "salut", "weight": 1.0}],
        "my": [{"text": "mon", "weight": 1.0}],
        "friend": [{"text": "ami", "weight": 1.0}]
    }
}"#;

/// Write a lexicon model where `LexiconLoader` expects to find it.
pub fn write_model(model_dir: &Path, engine_id: &str, json: &str) {
    let dir = model_dir.join(engine_id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(LEXICON_FILE), json).unwrap();
}

/// Lexicon loader that counts construction attempts per engine id.
pub struct CountingLoader {
    inner: LexiconLoader,
    calls: Mutex<HashMap<EngineId, usize>>,
}

impl CountingLoader {
    pub fn new(model_dir: &Path) -> Self {
        Self {
            inner: LexiconLoader::new(model_dir),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn calls(&self, id: &str) -> usize {
        self.calls
            .lock()
            .get(&EngineId::from(id))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

impl EngineLoader for CountingLoader {
    fn load(&self, id: &EngineId) -> Result<Arc<dyn TranslationEngine>, LoadError> {
        *self.calls.lock().entry(id.clone()).or_insert(0) += 1;
        self.inner.load(id)
    }
}
