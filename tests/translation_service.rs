mod common;

use std::num::NonZeroUsize;
use std::sync::Arc;

use polyglot_chat::engine::EngineId;
use polyglot_chat::metrics::MetricsRegistry;
use polyglot_chat::translate::{
    EngineCache, FailureReason, Invoker, LanguagePair, PairRegistry, TranslationOutcome,
    TranslationService, FALLBACK_MESSAGE,
};

use common::{write_model, CountingLoader, EN_ES, EN_FR};

struct Fixture {
    service: TranslationService,
    loader: Arc<CountingLoader>,
    _models: tempfile::TempDir,
}

fn fixture(capacity: usize, pairs: &[(&str, &str, &str)]) -> Fixture {
    let models = tempfile::tempdir().unwrap();
    write_model(models.path(), "en-es-engine", EN_ES);
    write_model(models.path(), "en-fr-engine", EN_FR);
    // de-en-engine deliberately has no model on disk

    let loader = Arc::new(CountingLoader::new(models.path()));
    let registry = PairRegistry::from_entries(
        pairs
            .iter()
            .map(|&(src, tgt, id)| (LanguagePair::new(src, tgt), EngineId::from(id))),
    );
    let service = TranslationService::new(
        Arc::new(registry),
        Arc::new(EngineCache::new(NonZeroUsize::new(capacity).unwrap())),
        loader.clone(),
        Invoker::default(),
        Arc::new(MetricsRegistry::new()),
    );
    Fixture {
        service,
        loader,
        _models: models,
    }
}

const ALL_PAIRS: &[(&str, &str, &str)] = &[
    ("en", "es", "en-es-engine"),
    ("en", "fr", "en-fr-engine"),
    ("de", "en", "de-en-engine"),
];

#[test]
fn translates_and_caches_the_engine() {
    let f = fixture(1, &[("en", "es", "en-es-engine")]);
    let outcome = f.service.translate("Hello", "en", "es");
    assert_eq!(outcome, TranslationOutcome::Translated("Hola".into()));
    assert_eq!(f.service.cache().resident(), vec![EngineId::from("en-es-engine")]);
}

#[test]
fn unregistered_pair_leaves_cache_untouched() {
    let f = fixture(1, &[("en", "es", "en-es-engine")]);
    f.service.translate("Hello", "en", "es");

    let outcome = f.service.translate("Hi", "en", "fr");
    assert_eq!(outcome, TranslationOutcome::Failed(FailureReason::UnsupportedPair));
    assert_eq!(outcome.text(), FALLBACK_MESSAGE);
    assert_eq!(f.service.cache().resident(), vec![EngineId::from("en-es-engine")]);
    assert_eq!(f.loader.total_calls(), 1);
}

#[test]
fn capacity_one_evicts_and_reloads() {
    let f = fixture(1, ALL_PAIRS);
    assert!(f.service.translate("my friend", "en", "es").is_translated());
    assert_eq!(
        f.service.translate("my friend", "en", "fr"),
        TranslationOutcome::Translated("mon ami".into())
    );
    assert!(!f.service.cache().contains(&EngineId::from("en-es-engine")));

    assert!(f.service.translate("my friend", "en", "es").is_translated());
    assert_eq!(f.loader.calls("en-es-engine"), 2);
    assert_eq!(f.loader.calls("en-fr-engine"), 1);
}

#[test]
fn failed_construction_is_never_cached() {
    let f = fixture(2, ALL_PAIRS);
    for attempt in 1..=2 {
        let outcome = f.service.translate("Guten Tag", "de", "en");
        assert_eq!(outcome, TranslationOutcome::Failed(FailureReason::EngineUnavailable));
        assert!(!f.service.cache().contains(&EngineId::from("de-en-engine")));
        assert_eq!(f.loader.calls("de-en-engine"), attempt);
    }
}

#[test]
fn same_language_short_circuits_without_loading() {
    let f = fixture(1, ALL_PAIRS);
    let outcome = f.service.translate("Hello there", "en", "en");
    assert_eq!(outcome, TranslationOutcome::Unchanged("Hello there".into()));
    assert!(f.service.cache().is_empty());
    assert_eq!(f.loader.total_calls(), 0);
}

#[test]
fn never_panics_on_odd_input() {
    let f = fixture(2, ALL_PAIRS);
    let long = "hello ".repeat(2_000);
    let inputs = ["", " ", "!!!", "😀 hello", "\u{0}", long.as_str(), "  my friend  "];
    for text in inputs {
        for (src, tgt) in [("en", "es"), ("en", "fr"), ("de", "en"), ("xx", "yy")] {
            let outcome = f.service.translate(text, src, tgt);
            assert!(!outcome.text().is_empty());
        }
    }
}

#[test]
fn concurrent_requests_share_one_load() {
    let f = Arc::new(fixture(2, ALL_PAIRS));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let f = Arc::clone(&f);
            std::thread::spawn(move || f.service.translate("hello my friend", "en", "es"))
        })
        .collect();
    for h in handles {
        assert_eq!(
            h.join().unwrap(),
            TranslationOutcome::Translated("hola mi amigo".into())
        );
    }
    assert_eq!(f.loader.calls("en-es-engine"), 1);
}
