//! Lexicon-backed engine: word-level monotone beam search over a JSON phrase table.
//! Model layout on disk: `<model_dir>/<engine_id>/lexicon.json`.
//! Unknown source pieces (names, punctuation, numbers) are copied through.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use super::{
    EngineId, EngineLoader, Encoding, GenerationParams, InferenceError, LoadError,
    TranslationEngine,
};

/// File name of the phrase table inside an engine directory.
pub const LEXICON_FILE: &str = "lexicon.json";

const PAD_ID: u32 = 0;
const UNK_ID: u32 = 1;
const EOS_ID: u32 = 2;
const FIRST_WORD_ID: u32 = 3;

/// Words, or single non-space symbols.
fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\w+(?:['’]\w+)*|[^\w\s]").expect("token pattern is valid")
    })
}

fn split_pieces(text: &str) -> Vec<String> {
    token_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// On-disk lexicon format.
#[derive(Debug, Deserialize)]
struct LexiconFile {
    #[serde(default = "default_lowercase")]
    lowercase: bool,
    entries: BTreeMap<String, Vec<CandidateFile>>,
    /// "prev next" target word pairs → additive log-score bonus.
    #[serde(default)]
    bigrams: BTreeMap<String, f32>,
}

#[derive(Debug, Deserialize)]
struct CandidateFile {
    text: String,
    weight: f32,
}

fn default_lowercase() -> bool {
    true
}

struct Candidate {
    target: Vec<u32>,
    log_prob: f32,
}

#[derive(Clone, Default)]
struct Hypothesis {
    tokens: Vec<u32>,
    score: f32,
}

/// Best score first; ties broken by token sequence so results never depend on
/// expansion order.
fn rank(hyps: &mut [Hypothesis]) {
    hyps.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.tokens.cmp(&b.tokens))
    });
}

/// A loaded lexicon engine. Immutable after construction, so it is shared
/// across worker threads without locking.
pub struct LexiconEngine {
    id: EngineId,
    lowercase: bool,
    source_vocab: HashMap<String, u32>,
    /// Indexed by `source_id - FIRST_WORD_ID`.
    candidates: Vec<Vec<Candidate>>,
    target_vocab: Vec<String>,
    bigrams: HashMap<(u32, u32), f32>,
    /// Generated ids at or above this value copy the source piece at `id - copy_base`.
    copy_base: u32,
}

impl LexiconEngine {
    /// Build an engine from the JSON text of a lexicon file.
    pub fn from_json(id: EngineId, json: &str) -> Result<Self, LoadError> {
        let corrupt = |message: String| LoadError::Corrupt {
            engine_id: id.clone(),
            message,
        };

        let file: LexiconFile =
            serde_json::from_str(json).map_err(|e| corrupt(format!("invalid lexicon JSON: {e}")))?;
        if file.entries.is_empty() {
            return Err(corrupt("lexicon has no entries".into()));
        }

        let mut target_vocab: Vec<String> = vec!["<pad>".into(), "<unk>".into(), "</s>".into()];
        let mut target_index: HashMap<String, u32> = HashMap::new();
        let mut intern = |word: &str, vocab: &mut Vec<String>| -> u32 {
            if let Some(&id) = target_index.get(word) {
                return id;
            }
            let id = vocab.len() as u32;
            vocab.push(word.to_string());
            target_index.insert(word.to_string(), id);
            id
        };

        let mut source_vocab = HashMap::with_capacity(file.entries.len());
        let mut candidates = Vec::with_capacity(file.entries.len());

        for (source, options) in &file.entries {
            let pieces = split_pieces(source);
            if pieces.len() != 1 {
                return Err(corrupt(format!(
                    "entry {source:?} must be exactly one token"
                )));
            }
            if options.is_empty() {
                return Err(corrupt(format!("entry {source:?} has no candidates")));
            }

            let mut parsed = Vec::with_capacity(options.len());
            for option in options {
                if !(option.weight.is_finite() && option.weight > 0.0) {
                    return Err(corrupt(format!(
                        "entry {source:?} candidate {:?} has non-positive weight",
                        option.text
                    )));
                }
                let words = split_pieces(&option.text);
                if words.is_empty() {
                    return Err(corrupt(format!("entry {source:?} has an empty candidate")));
                }
                let target = words
                    .iter()
                    .map(|w| intern(w, &mut target_vocab))
                    .collect();
                parsed.push(Candidate {
                    target,
                    log_prob: option.weight.ln(),
                });
            }

            let key = if file.lowercase {
                source.to_lowercase()
            } else {
                source.clone()
            };
            let source_id = FIRST_WORD_ID + candidates.len() as u32;
            if source_vocab.insert(key, source_id).is_some() {
                return Err(corrupt(format!("entry {source:?} is duplicated")));
            }
            candidates.push(parsed);
        }

        let mut bigrams = HashMap::with_capacity(file.bigrams.len());
        for (pair, bonus) in &file.bigrams {
            let words: Vec<&str> = pair.split_whitespace().collect();
            let [prev, next] = words.as_slice() else {
                return Err(corrupt(format!("bigram {pair:?} must name two words")));
            };
            // A bigram over words no candidate produces can never fire.
            if let (Some(&p), Some(&n)) = (target_index.get(*prev), target_index.get(*next)) {
                bigrams.insert((p, n), *bonus);
            }
        }

        let copy_base = target_vocab.len() as u32;
        Ok(Self {
            id,
            lowercase: file.lowercase,
            source_vocab,
            candidates,
            target_vocab,
            bigrams,
            copy_base,
        })
    }

    /// Number of distinct source words the engine knows.
    pub fn source_vocab_len(&self) -> usize {
        self.source_vocab.len()
    }

    fn options_for(
        &self,
        source_id: u32,
        position: usize,
    ) -> Result<Vec<(Vec<u32>, f32)>, InferenceError> {
        if source_id >= FIRST_WORD_ID {
            if let Some(options) = self.candidates.get((source_id - FIRST_WORD_ID) as usize) {
                return Ok(options
                    .iter()
                    .map(|c| (c.target.clone(), c.log_prob))
                    .collect());
            }
        }
        let copy = u32::try_from(position)
            .ok()
            .and_then(|p| self.copy_base.checked_add(p))
            .ok_or_else(|| {
                InferenceError::Generate(format!("source position {position} out of range"))
            })?;
        Ok(vec![(vec![copy], 0.0)])
    }
}

impl TranslationEngine for LexiconEngine {
    fn engine_id(&self) -> &EngineId {
        &self.id
    }

    fn encode(&self, text: &str) -> Result<Encoding, InferenceError> {
        let pieces = split_pieces(text);
        if pieces.is_empty() {
            return Err(InferenceError::Tokenize("input has no tokens".into()));
        }
        let ids = pieces
            .iter()
            .map(|piece| {
                let lookup = if self.lowercase {
                    self.source_vocab.get(&piece.to_lowercase())
                } else {
                    self.source_vocab.get(piece)
                };
                lookup.copied().unwrap_or(UNK_ID)
            })
            .collect();
        Ok(Encoding { ids, pieces })
    }

    fn generate(
        &self,
        input: &Encoding,
        params: &GenerationParams,
    ) -> Result<Vec<u32>, InferenceError> {
        if params.num_beams == 0 || params.max_length == 0 {
            return Err(InferenceError::Generate(
                "num_beams and max_length must be > 0".into(),
            ));
        }

        let mut beams = vec![Hypothesis::default()];
        let mut finished: Vec<Hypothesis> = Vec::new();

        for (position, &source_id) in input.ids.iter().enumerate() {
            let options = self.options_for(source_id, position)?;
            let mut expanded = Vec::with_capacity(beams.len() * options.len());
            for beam in &beams {
                for (target, log_prob) in &options {
                    let bonus = match (beam.tokens.last(), target.first()) {
                        (Some(prev), Some(next)) => {
                            self.bigrams.get(&(*prev, *next)).copied().unwrap_or(0.0)
                        }
                        _ => 0.0,
                    };
                    let mut tokens = beam.tokens.clone();
                    tokens.extend_from_slice(target);
                    expanded.push(Hypothesis {
                        tokens,
                        score: beam.score + log_prob + bonus,
                    });
                }
            }
            rank(&mut expanded);
            expanded.truncate(params.num_beams);

            beams.clear();
            for mut hyp in expanded {
                if hyp.tokens.len() >= params.max_length {
                    hyp.tokens.truncate(params.max_length);
                    finished.push(hyp);
                } else {
                    beams.push(hyp);
                }
            }
            if beams.is_empty() || (params.early_stopping && finished.len() >= params.num_beams) {
                break;
            }
        }

        finished.extend(beams);
        rank(&mut finished);
        let best = finished
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::Generate("search produced no hypothesis".into()))?;

        let mut output = best.tokens;
        output.push(EOS_ID);
        debug!(
            engine = %self.id,
            input_tokens = input.len(),
            output_tokens = output.len(),
            score = best.score,
            "beam search finished"
        );
        Ok(output)
    }

    fn decode(&self, output: &[u32], input: &Encoding) -> Result<String, InferenceError> {
        let mut words: Vec<&str> = Vec::with_capacity(output.len());
        for &id in output {
            match id {
                EOS_ID => break,
                PAD_ID | UNK_ID => continue,
                id if id >= self.copy_base => {
                    let piece = input
                        .pieces
                        .get((id - self.copy_base) as usize)
                        .ok_or_else(|| {
                            InferenceError::Decode(format!("copy token {id} has no source piece"))
                        })?;
                    words.push(piece);
                }
                id => {
                    let word = self
                        .target_vocab
                        .get(id as usize)
                        .ok_or_else(|| InferenceError::Decode(format!("unknown target id {id}")))?;
                    words.push(word);
                }
            }
        }

        let text = detokenize(&words);
        let source_capitalized = input
            .pieces
            .first()
            .and_then(|p| p.chars().next())
            .is_some_and(char::is_uppercase);
        Ok(if source_capitalized {
            capitalize_first(&text)
        } else {
            text
        })
    }
}

/// Join words with spaces, gluing punctuation to its neighbour.
fn detokenize(words: &[&str]) -> String {
    const NO_SPACE_BEFORE: &[&str] = &[".", ",", "!", "?", ";", ":", ")", "]", "}", "%", "…"];
    const NO_SPACE_AFTER: &[&str] = &["(", "[", "{", "¿", "¡"];

    let mut out = String::new();
    let mut glue_next = true;
    for word in words {
        if !glue_next && !NO_SPACE_BEFORE.contains(word) {
            out.push(' ');
        }
        out.push_str(word);
        glue_next = NO_SPACE_AFTER.contains(word);
    }
    out
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Loads lexicon engines from a model directory.
pub struct LexiconLoader {
    model_dir: PathBuf,
}

impl LexiconLoader {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }

    /// Location of the lexicon file for `id`.
    pub fn model_path(&self, id: &EngineId) -> PathBuf {
        self.model_dir.join(id.as_str()).join(LEXICON_FILE)
    }
}

impl EngineLoader for LexiconLoader {
    fn load(&self, id: &EngineId) -> Result<Arc<dyn TranslationEngine>, LoadError> {
        let path = self.model_path(id);
        let content = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LoadError::NotFound {
                engine_id: id.clone(),
                path: path.clone(),
            },
            _ => LoadError::Io {
                engine_id: id.clone(),
                message: format!("{}: {e}", path.display()),
            },
        })?;

        let engine = LexiconEngine::from_json(id.clone(), &content)?;
        info!(
            engine = %id,
            path = %path.display(),
            source_words = engine.source_vocab_len(),
            "lexicon engine loaded"
        );
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EN_ES: &str = r#"{
        "entries": {
            "hello": [{"text": "hola", "weight": 0.9}, {"text": "buenas", "weight": 0.1}],
            "my": [{"text": "mi", "weight": 1.0}],
            "friend": [{"text": "amigo", "weight": 1.0}],
            "very": [{"text": "muy", "weight": 0.4}, {"text": "bastante", "weight": 0.6}],
            "good": [{"text": "bien", "weight": 0.4}, {"text": "bueno", "weight": 0.6}],
            "morning": [{"text": "buenos días", "weight": 1.0}]
        },
        "bigrams": {"muy bien": 1.0}
    }"#;

    fn engine() -> LexiconEngine {
        LexiconEngine::from_json(EngineId::from("test-en-es"), EN_ES).unwrap()
    }

    fn run(engine: &LexiconEngine, text: &str, params: GenerationParams) -> String {
        let input = engine.encode(text).unwrap();
        let output = engine.generate(&input, &params).unwrap();
        engine.decode(&output, &input).unwrap()
    }

    #[test]
    fn translates_word_by_word_with_punctuation_copied() {
        let e = engine();
        assert_eq!(
            run(&e, "Hello, my friend!", GenerationParams::default()),
            "Hola, mi amigo!"
        );
    }

    #[test]
    fn unknown_words_are_copied_through() {
        let e = engine();
        assert_eq!(
            run(&e, "hello Zorblax", GenerationParams::default()),
            "hola Zorblax"
        );
    }

    #[test]
    fn multi_word_candidates_expand() {
        let e = engine();
        assert_eq!(run(&e, "morning", GenerationParams::default()), "buenos días");
    }

    #[test]
    fn beam_search_finds_bigram_path_greedy_misses() {
        let e = engine();
        let greedy = GenerationParams {
            num_beams: 1,
            ..GenerationParams::default()
        };
        assert_eq!(run(&e, "very good", greedy), "bastante bueno");
        assert_eq!(run(&e, "very good", GenerationParams::default()), "muy bien");
    }

    #[test]
    fn generation_is_deterministic() {
        let e = engine();
        let first = run(&e, "very good my friend", GenerationParams::default());
        for _ in 0..5 {
            assert_eq!(run(&e, "very good my friend", GenerationParams::default()), first);
        }
    }

    #[test]
    fn max_length_bounds_output() {
        let e = engine();
        let params = GenerationParams {
            max_length: 2,
            ..GenerationParams::default()
        };
        let input = e.encode("hello my friend").unwrap();
        let output = e.generate(&input, &params).unwrap();
        // two content tokens plus EOS
        assert_eq!(output.len(), 3);
        assert_eq!(e.decode(&output, &input).unwrap(), "hola mi");
    }

    #[test]
    fn encode_rejects_input_without_tokens() {
        let e = engine();
        assert!(matches!(e.encode("   "), Err(InferenceError::Tokenize(_))));
    }

    #[test]
    fn zero_beams_is_a_generation_error() {
        let e = engine();
        let input = e.encode("hello").unwrap();
        let params = GenerationParams {
            num_beams: 0,
            ..GenerationParams::default()
        };
        assert!(matches!(
            e.generate(&input, &params),
            Err(InferenceError::Generate(_))
        ));
    }

    #[test]
    fn rejects_corrupt_lexicons() {
        let id = EngineId::from("bad");
        for json in [
            "not json",
            r#"{"entries": {}}"#,
            r#"{"entries": {"hi": [{"text": "hola", "weight": 0.0}]}}"#,
            r#"{"entries": {"two words": [{"text": "dos", "weight": 1.0}]}}"#,
            r#"{"entries": {"hi": []}}"#,
        ] {
            let result = LexiconEngine::from_json(id.clone(), json);
            assert!(
                matches!(result, Err(LoadError::Corrupt { .. })),
                "expected corrupt for {json}"
            );
        }
    }

    #[test]
    fn loader_reports_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let loader = LexiconLoader::new(dir.path());
        let err = loader.load(&EngineId::from("org/missing")).err().unwrap();
        assert!(matches!(err, LoadError::NotFound { .. }));
    }

    #[test]
    fn loader_reads_nested_engine_directory() {
        let dir = tempfile::tempdir().unwrap();
        let id = EngineId::from("Helsinki-NLP/opus-mt-en-es");
        let loader = LexiconLoader::new(dir.path());
        let path = loader.model_path(&id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, EN_ES).unwrap();

        let engine = loader.load(&id).unwrap();
        assert_eq!(engine.engine_id(), &id);
        let input = engine.encode("my friend").unwrap();
        let output = engine.generate(&input, &GenerationParams::default()).unwrap();
        assert_eq!(engine.decode(&output, &input).unwrap(), "mi amigo");
    }
}
