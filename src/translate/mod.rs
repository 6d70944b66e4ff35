//! Translation core: pair registry → engine cache → invoker, behind one service.
//! Every failure is folded into a single fallback outcome at this boundary.

pub mod cache;
pub mod invoker;
pub mod registry;
pub mod service;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use cache::{CacheStats, EngineCache};
pub use invoker::Invoker;
pub use registry::{PairRegistry, RegistryError};
pub use service::TranslationService;

/// Text returned in place of a translation whenever anything goes wrong.
pub const FALLBACK_MESSAGE: &str = "[Translation unavailable for the selected language pair.]";

/// Returns true if `text` is the fallback marker (the check adapters have always used).
pub fn is_fallback(text: &str) -> bool {
    text.starts_with('[') && text.contains("unavailable")
}

/// Short language tag such as `en` or `es`. Compared byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageCode(String);

impl LanguageCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LanguageCode {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Ordered (source, target) pair; `(en, es)` and `(es, en)` are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LanguagePair {
    pub source: LanguageCode,
    pub target: LanguageCode,
}

impl LanguagePair {
    pub fn new(source: impl Into<LanguageCode>, target: impl Into<LanguageCode>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.target)
    }
}

/// One translation call as handed over by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateRequest {
    pub request_id: String,
    pub text: String,
    pub source: LanguageCode,
    pub target: LanguageCode,
}

impl TranslateRequest {
    pub fn new(
        text: impl Into<String>,
        source: impl Into<LanguageCode>,
        target: impl Into<LanguageCode>,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            source: source.into(),
            target: target.into(),
        }
    }

    pub fn pair(&self) -> LanguagePair {
        LanguagePair {
            source: self.source.clone(),
            target: self.target.clone(),
        }
    }
}

/// Why a translation failed. Kept for logs and tests; callers see one fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidInput,
    UnsupportedPair,
    EngineUnavailable,
    InferenceFailed,
    /// The caller stopped waiting before a result was produced.
    Cancelled,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::InvalidInput => "invalid_input",
            FailureReason::UnsupportedPair => "unsupported_pair",
            FailureReason::EngineUnavailable => "engine_unavailable",
            FailureReason::InferenceFailed => "inference_failed",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one `translate` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationOutcome {
    Translated(String),
    /// Source and target were the same language; text returned as-is.
    Unchanged(String),
    Failed(FailureReason),
}

impl TranslationOutcome {
    /// The externally visible text: the translation, the original, or the fallback marker.
    pub fn text(&self) -> &str {
        match self {
            TranslationOutcome::Translated(text) | TranslationOutcome::Unchanged(text) => text,
            TranslationOutcome::Failed(_) => FALLBACK_MESSAGE,
        }
    }

    pub fn is_translated(&self) -> bool {
        matches!(self, TranslationOutcome::Translated(_))
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            TranslationOutcome::Failed(reason) => Some(*reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_are_directional() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(LanguagePair::new("en", "es"));
        assert!(set.contains(&LanguagePair::new("en", "es")));
        assert!(!set.contains(&LanguagePair::new("es", "en")));
    }

    #[test]
    fn failed_outcomes_expose_the_fallback_marker() {
        for reason in [
            FailureReason::InvalidInput,
            FailureReason::UnsupportedPair,
            FailureReason::EngineUnavailable,
            FailureReason::InferenceFailed,
        ] {
            let outcome = TranslationOutcome::Failed(reason);
            assert_eq!(outcome.text(), FALLBACK_MESSAGE);
            assert!(is_fallback(outcome.text()));
            assert_eq!(outcome.failure(), Some(reason));
        }
        assert!(!is_fallback(TranslationOutcome::Translated("hola".into()).text()));
        assert_eq!(TranslationOutcome::Unchanged("hi".into()).text(), "hi");
    }
}
