//! Single entry point used by every adapter.
//! registry lookup → cache fetch/load → invoke, with every failure mapped to one outcome.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span};

use super::{
    EngineCache, FailureReason, Invoker, LanguagePair, PairRegistry, TranslateRequest,
    TranslationOutcome,
};
use crate::engine::{EngineLoader, InferenceError};
use crate::metrics::{metric_names, MetricsRegistry};

/// Characters of input text included in error logs.
const LOG_TEXT_CHARS: usize = 64;

pub struct TranslationService {
    registry: Arc<PairRegistry>,
    cache: Arc<EngineCache>,
    loader: Arc<dyn EngineLoader>,
    invoker: Invoker,
    metrics: Arc<MetricsRegistry>,
}

impl TranslationService {
    pub fn new(
        registry: Arc<PairRegistry>,
        cache: Arc<EngineCache>,
        loader: Arc<dyn EngineLoader>,
        invoker: Invoker,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            registry,
            cache,
            loader,
            invoker,
            metrics,
        }
    }

    pub fn registry(&self) -> &PairRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<EngineCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Translate `text` from `source` to `target`. Never panics on bad input or engine faults.
    pub fn translate(&self, text: &str, source: &str, target: &str) -> TranslationOutcome {
        self.translate_request(&TranslateRequest::new(text, source, target), None)
    }

    /// Blocking: may load an engine and run inference. Call from a worker thread.
    pub fn translate_request(
        &self,
        request: &TranslateRequest,
        cancel: Option<&CancellationToken>,
    ) -> TranslationOutcome {
        let span = info_span!(
            "translate",
            request_id = %request.request_id,
            source = %request.source,
            target = %request.target
        );
        let _entered = span.enter();
        let total = self.metrics.span(metric_names::TRANSLATE_TOTAL);

        let outcome = self.run(request, cancel);
        if let TranslationOutcome::Failed(reason) = &outcome {
            debug!(reason = %reason, "translation fell back");
        }
        total.finish();
        outcome
    }

    fn run(
        &self,
        request: &TranslateRequest,
        cancel: Option<&CancellationToken>,
    ) -> TranslationOutcome {
        // Whitespace-only text is not empty and goes to the engine.
        if request.text.is_empty() {
            return TranslationOutcome::Failed(FailureReason::InvalidInput);
        }
        if request.source == request.target {
            return TranslationOutcome::Unchanged(request.text.clone());
        }

        let pair = request.pair();
        let Some(engine_id) = self.registry.lookup(&pair) else {
            return TranslationOutcome::Failed(FailureReason::UnsupportedPair);
        };

        // A panicking loader reaches waiters as `Aborted`; the leader sees the panic here.
        let loaded = panic::catch_unwind(AssertUnwindSafe(|| {
            self.cache.get_or_load(engine_id, || {
                let load = self.metrics.span(metric_names::ENGINE_LOAD);
                let result = self.loader.load(engine_id);
                load.finish();
                result
            })
        }));
        let engine = match loaded {
            Ok(Ok(engine)) => engine,
            Err(payload) => {
                error!(
                    engine = %engine_id,
                    pair = %pair,
                    panic = panic_message(payload.as_ref()),
                    "engine loader panicked"
                );
                return TranslationOutcome::Failed(FailureReason::EngineUnavailable);
            }
            Ok(Err(e)) => {
                error!(
                    engine = %engine_id,
                    pair = %pair,
                    text = %truncate_for_log(&request.text),
                    error = %e,
                    "engine unavailable"
                );
                return TranslationOutcome::Failed(FailureReason::EngineUnavailable);
            }
        };

        let inference = self.metrics.span(metric_names::INFERENCE);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.invoker.invoke(engine.as_ref(), &request.text, cancel)
        }));
        inference.finish();

        let result = match result {
            Ok(result) => result,
            Err(payload) => {
                error!(
                    engine = %engine_id,
                    pair = %pair,
                    text = %truncate_for_log(&request.text),
                    panic = panic_message(payload.as_ref()),
                    "engine panicked during inference"
                );
                return TranslationOutcome::Failed(FailureReason::InferenceFailed);
            }
        };

        match result {
            Ok(translated) => TranslationOutcome::Translated(translated),
            Err(InferenceError::Cancelled) => TranslationOutcome::Failed(FailureReason::Cancelled),
            Err(e) => {
                log_inference_failure(engine_id.as_str(), &pair, &request.text, &e);
                TranslationOutcome::Failed(FailureReason::InferenceFailed)
            }
        }
    }
}

fn log_inference_failure(engine: &str, pair: &LanguagePair, text: &str, e: &InferenceError) {
    error!(
        engine,
        pair = %pair,
        text = %truncate_for_log(text),
        error = %e,
        "translation failed"
    );
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

fn truncate_for_log(text: &str) -> String {
    let mut out: String = text.chars().take(LOG_TEXT_CHARS).collect();
    if text.chars().count() > LOG_TEXT_CHARS {
        out.push('…');
    }
    out
}
