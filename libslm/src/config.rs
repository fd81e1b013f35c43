use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Runtime knobs of the trigram model engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Capacity of the final-score trigram cache.
    pub trigram_cache_size: usize,
    /// Capacity of the bigram-record cache.
    pub bigram_cache_size: usize,
    /// Reset both probability caches at every utterance end.
    pub clear_cache_after_utterance: bool,
    /// Bake `language_weight` and `word_insertion_probability` into the
    /// tabulated log probabilities while the model loads.
    pub apply_language_weight_and_wip: bool,
    pub language_weight: f32,
    pub word_insertion_probability: f64,
    /// Interpolation weight of the unigram distribution against uniform.
    /// Must be in `(0, 1]`.
    pub unigram_weight: f32,
    /// Enable the smear engine.
    pub full_smear: bool,
    /// Smear sidecar file. Read when present and consistent with the model,
    /// otherwise the terms are rebuilt from scratch.
    pub smear_file: Option<PathBuf>,
    /// Maximum queried n-gram arity; 0 means use the file maximum. Values
    /// above the file maximum are clamped to it.
    pub max_depth: usize,
    /// When set, every queried sequence is appended to this file between
    /// utterance markers.
    pub query_log_file: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> ModelConfig {
        ModelConfig {
            trigram_cache_size: 100_000,
            bigram_cache_size: 50_000,
            clear_cache_after_utterance: false,
            apply_language_weight_and_wip: false,
            language_weight: 1.0,
            word_insertion_probability: 1.0,
            unigram_weight: 1.0,
            full_smear: false,
            smear_file: None,
            max_depth: 0,
            query_log_file: None,
        }
    }
}
