use std::collections::HashSet;

use anyhow::Result;

use crate::dictionary::Word;

/// The narrow interface the decoder consumes.
///
/// `start` and `stop` bracket one utterance; demand-loaded buffer lifetimes
/// are tied to those boundaries. For a fixed sequence of start/query/stop
/// calls the returned scores are deterministic and independent of cache
/// contents.
pub trait LanguageModel {
    /// Called before a recognition.
    fn start(&mut self);

    /// Called after a recognition.
    fn stop(&mut self);

    /// `P(last word | preceding words)` in the host log base.
    fn probability(&mut self, words: &[Word]) -> Result<f32>;

    /// Stored back-off weight of the innermost matching context.
    fn backoff(&mut self, words: &[Word]) -> Result<f32>;

    /// Smear term for the history; 1.0 unless full smear is enabled.
    fn smear(&mut self, words: &[Word]) -> Result<f32>;

    /// Effective maximum n-gram arity.
    fn max_depth(&self) -> usize;

    /// Every word the model tabulates.
    fn vocabulary(&self) -> HashSet<String>;
}
