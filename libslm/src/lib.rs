//! Disk-resident trigram language model query engine.
//!
//! Answers `P(w | history)` with Katz back-off against a packed binary
//! n-gram model. The unigram table and the de-duplicated probability tables
//! live in memory; bigram and trigram follower slices are demand-paged from
//! the model file and cached per utterance.
//!
//! The engine sees words only through the [`dictionary::WordResolver`]
//! capability, so it plugs into whatever dictionary the surrounding decoder
//! uses. All returned scores are in the [`log_math::LogMath`] host base.

pub mod config;
pub mod dictionary;
pub mod lm;
pub mod log_math;
