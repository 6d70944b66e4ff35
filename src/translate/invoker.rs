//! One synchronous inference call: encode → truncate → generate → decode.
//! Runs on a translation worker thread, never while holding the cache lock.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{GenerationParams, InferenceError, TranslationEngine};

/// Longest input handed to an engine; longer texts are truncated, not rejected.
pub const DEFAULT_MAX_INPUT_TOKENS: usize = 512;

#[derive(Debug, Clone, Copy)]
pub struct Invoker {
    max_input_tokens: usize,
    params: GenerationParams,
}

impl Default for Invoker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INPUT_TOKENS, GenerationParams::default())
    }
}

impl Invoker {
    pub fn new(max_input_tokens: usize, params: GenerationParams) -> Self {
        Self {
            max_input_tokens: max_input_tokens.max(1),
            params,
        }
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn max_input_tokens(&self) -> usize {
        self.max_input_tokens
    }

    /// Translate `text` with `engine`.
    ///
    /// Cancellation is best effort: the token is checked between stages, but a
    /// `generate` call already running is not interrupted.
    pub fn invoke(
        &self,
        engine: &dyn TranslationEngine,
        text: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, InferenceError> {
        let cancelled = || cancel.is_some_and(CancellationToken::is_cancelled);

        let mut input = engine.encode(text)?;
        if input.len() > self.max_input_tokens {
            debug!(
                engine = %engine.engine_id(),
                tokens = input.len(),
                max = self.max_input_tokens,
                "truncating input"
            );
            input.truncate(self.max_input_tokens);
        }

        if cancelled() {
            return Err(InferenceError::Cancelled);
        }
        let output = engine.generate(&input, &self.params)?;

        if cancelled() {
            return Err(InferenceError::Cancelled);
        }
        engine.decode(&output, &input)
    }
}
