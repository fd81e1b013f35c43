use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use rustc_hash::FxHashMap;

use crate::lm::loader::{FORMAT_VERSION, HEADER_BYTES, MODEL_MAGIC};

/// Default bigrams-per-segment exponent (512 bigrams per segment entry).
pub const DEFAULT_LOG_BIGRAM_SEGMENT_SIZE: u32 = 9;

/// Assembles an n-gram model in memory and writes the packed binary layout.
///
/// Probabilities and back-off weights are given in log10, the way n-gram
/// toolkits tabulate them; the loader converts to the host log base. Word ids
/// follow `add_unigram` insertion order.
pub struct ModelBuilder {
    words: Vec<String>,
    index: FxHashMap<String, u32>,
    unigrams: Vec<(f32, f32)>,
    bigrams: BTreeMap<(u32, u32), (f32, f32)>,
    trigrams: BTreeMap<(u32, u32, u32), f32>,
    log_bigram_segment_size: u32,
    big_endian: bool,
}

impl Default for ModelBuilder {
    fn default() -> ModelBuilder {
        ModelBuilder {
            words: Vec::new(),
            index: FxHashMap::default(),
            unigrams: Vec::new(),
            bigrams: BTreeMap::new(),
            trigrams: BTreeMap::new(),
            log_bigram_segment_size: DEFAULT_LOG_BIGRAM_SEGMENT_SIZE,
            big_endian: false,
        }
    }
}

impl ModelBuilder {
    pub fn new() -> ModelBuilder {
        ModelBuilder::default()
    }

    pub fn log_bigram_segment_size(&mut self, exponent: u32) -> &mut Self {
        self.log_bigram_segment_size = exponent;
        self
    }

    pub fn big_endian(&mut self, big_endian: bool) -> &mut Self {
        self.big_endian = big_endian;
        self
    }

    /// Adds a word with its log10 probability and back-off weight, returning
    /// its id. Re-adding a word overwrites the values.
    pub fn add_unigram(&mut self, word: &str, log10_prob: f32, log10_backoff: f32) -> u32 {
        if let Some(&id) = self.index.get(word) {
            self.unigrams[id as usize] = (log10_prob, log10_backoff);
            return id;
        }
        let id = self.words.len() as u32;
        self.words.push(word.to_string());
        self.index.insert(word.to_string(), id);
        self.unigrams.push((log10_prob, log10_backoff));
        id
    }

    /// Adds a bigram over two known words. The back-off weight applies to
    /// trigram histories starting with this pair.
    pub fn add_bigram(
        &mut self,
        first: &str,
        second: &str,
        log10_prob: f32,
        log10_backoff: f32,
    ) -> Result<()> {
        let first = self.word_id(first)?;
        let second = self.word_id(second)?;
        self.bigrams
            .insert((first, second), (log10_prob, log10_backoff));
        Ok(())
    }

    pub fn add_trigram(
        &mut self,
        first: &str,
        second: &str,
        third: &str,
        log10_prob: f32,
    ) -> Result<()> {
        let first = self.word_id(first)?;
        let second = self.word_id(second)?;
        let third = self.word_id(third)?;
        self.trigrams.insert((first, second, third), log10_prob);
        Ok(())
    }

    fn word_id(&self, word: &str) -> Result<u32> {
        match self.index.get(word) {
            Some(&id) => Ok(id),
            None => anyhow::bail!("word {word:?} has no unigram entry"),
        }
    }

    fn spelling(&self, id: u32) -> &str {
        &self.words[id as usize]
    }

    /// Writes the model file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.assemble()?;
        fs::write(path, bytes)
            .with_context(|| format!("cannot write model file {}", path.display()))?;
        Ok(())
    }

    fn assemble(&self) -> Result<Vec<u8>> {
        let number_unigrams = self.words.len();
        ensure!(number_unigrams > 0, "model has no unigrams");
        ensure!(
            number_unigrams <= usize::from(u16::MAX) + 1,
            "{number_unigrams} words do not fit 16-bit record ids"
        );
        for &(first, second, third) in self.trigrams.keys() {
            ensure!(
                self.bigrams.contains_key(&(first, second)),
                "trigram ({} {} {}) has no parent bigram",
                self.spelling(first),
                self.spelling(second),
                self.spelling(third),
            );
        }

        let number_bigrams = self.bigrams.len();
        let number_trigrams = self.trigrams.len();
        let max_depth: u32 = match (number_bigrams, number_trigrams) {
            (0, _) => 1,
            (_, 0) => 2,
            _ => 3,
        };

        let (bigram_prob_table, bigram_prob_ids) =
            dedup_table(self.bigrams.values().map(|&(probability, _)| probability))?;
        let (trigram_backoff_table, bigram_backoff_ids) =
            dedup_table(self.bigrams.values().map(|&(_, backoff)| backoff))?;
        let (trigram_prob_table, trigram_prob_ids) = dedup_table(self.trigrams.values().copied())?;

        // Cumulative follower offsets per word.
        let mut first_bigram_entry = vec![0u32; number_unigrams + 1];
        for &(first, _) in self.bigrams.keys() {
            first_bigram_entry[first as usize + 1] += 1;
        }
        for id in 0..number_unigrams {
            first_bigram_entry[id + 1] += first_bigram_entry[id];
        }

        // Cumulative trigram start per global bigram position. The entry at
        // `number_bigrams` backs the sentinel record.
        let mut trigram_starts = Vec::with_capacity(number_bigrams + 1);
        let mut cumulative = 0u32;
        for &(first, second) in self.bigrams.keys() {
            trigram_starts.push(cumulative);
            cumulative += self
                .trigrams
                .range((first, second, 0)..=(first, second, u32::MAX))
                .count() as u32;
        }
        trigram_starts.push(cumulative);

        let segment_size = 1usize << self.log_bigram_segment_size;
        let segment_count = (number_bigrams >> self.log_bigram_segment_size) + 1;
        let mut segment_table = Vec::with_capacity(segment_count);
        for segment in 0..segment_count {
            segment_table.push(trigram_starts[segment * segment_size]);
        }

        let big_endian = self.big_endian;
        let mut bigram_section = Vec::with_capacity((number_bigrams + 1) * 8);
        for (position, (&(_, second), _)) in self.bigrams.iter().enumerate() {
            let offset =
                trigram_starts[position] - segment_table[position >> self.log_bigram_segment_size];
            ensure!(
                offset <= u32::from(u16::MAX),
                "trigram offsets overflow segment {}; lower log_bigram_segment_size",
                position >> self.log_bigram_segment_size,
            );
            put_u16(&mut bigram_section, second as u16, big_endian);
            put_u16(&mut bigram_section, bigram_prob_ids[position], big_endian);
            put_u16(&mut bigram_section, bigram_backoff_ids[position], big_endian);
            put_u16(&mut bigram_section, offset as u16, big_endian);
        }
        if number_bigrams > 0 {
            let offset = trigram_starts[number_bigrams]
                - segment_table[number_bigrams >> self.log_bigram_segment_size];
            ensure!(
                offset <= u32::from(u16::MAX),
                "trigram offsets overflow the sentinel segment; lower log_bigram_segment_size",
            );
            put_u16(&mut bigram_section, 0, big_endian);
            put_u16(&mut bigram_section, 0, big_endian);
            put_u16(&mut bigram_section, 0, big_endian);
            put_u16(&mut bigram_section, offset as u16, big_endian);
        }

        let mut trigram_section = Vec::with_capacity(number_trigrams * 4);
        for (position, &(_, _, third)) in self.trigrams.keys().enumerate() {
            put_u16(&mut trigram_section, third as u16, big_endian);
            put_u16(&mut trigram_section, trigram_prob_ids[position], big_endian);
        }

        let mut body = Vec::new();
        for word in &self.words {
            put_u32(&mut body, word.len() as u32, big_endian);
            body.extend_from_slice(word.as_bytes());
        }
        for (id, &(log10_prob, log10_backoff)) in self.unigrams.iter().enumerate() {
            put_f32(&mut body, log10_prob, big_endian);
            put_f32(&mut body, log10_backoff, big_endian);
            put_u32(&mut body, first_bigram_entry[id], big_endian);
            put_u32(&mut body, id as u32, big_endian);
        }
        put_float_table(&mut body, &bigram_prob_table, big_endian);
        put_float_table(&mut body, &trigram_prob_table, big_endian);
        put_float_table(&mut body, &trigram_backoff_table, big_endian);
        put_u32(&mut body, segment_table.len() as u32, big_endian);
        for &entry in &segment_table {
            put_u32(&mut body, entry, big_endian);
        }

        let bigram_offset = HEADER_BYTES + body.len() as u64;
        let trigram_offset = bigram_offset + bigram_section.len() as u64;
        ensure!(
            u32::try_from(trigram_offset + trigram_section.len() as u64).is_ok(),
            "model does not fit 32-bit section offsets"
        );

        let mut out = Vec::with_capacity(
            HEADER_BYTES as usize + body.len() + bigram_section.len() + trigram_section.len(),
        );
        put_u32(&mut out, MODEL_MAGIC, big_endian);
        put_u32(&mut out, FORMAT_VERSION, big_endian);
        put_u32(&mut out, max_depth, big_endian);
        put_u32(&mut out, number_unigrams as u32, big_endian);
        put_u32(&mut out, number_bigrams as u32, big_endian);
        put_u32(&mut out, number_trigrams as u32, big_endian);
        put_u32(&mut out, self.log_bigram_segment_size, big_endian);
        put_u32(&mut out, bigram_offset as u32, big_endian);
        put_u32(&mut out, trigram_offset as u32, big_endian);
        out.extend_from_slice(&body);
        out.extend_from_slice(&bigram_section);
        out.extend_from_slice(&trigram_section);
        Ok(out)
    }
}

fn dedup_table(values: impl Iterator<Item = f32>) -> Result<(Vec<f32>, Vec<u16>)> {
    let mut table = Vec::new();
    let mut seen: FxHashMap<u32, u16> = FxHashMap::default();
    let mut ids = Vec::new();
    for value in values {
        let id = match seen.get(&value.to_bits()) {
            Some(&id) => id,
            None => {
                ensure!(
                    table.len() <= usize::from(u16::MAX),
                    "probability table overflows 16-bit record ids"
                );
                let id = table.len() as u16;
                seen.insert(value.to_bits(), id);
                table.push(value);
                id
            }
        };
        ids.push(id);
    }
    Ok((table, ids))
}

fn put_u16(out: &mut Vec<u8>, value: u16, big_endian: bool) {
    out.extend_from_slice(&if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    });
}

fn put_u32(out: &mut Vec<u8>, value: u32, big_endian: bool) {
    out.extend_from_slice(&if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    });
}

fn put_f32(out: &mut Vec<u8>, value: f32, big_endian: bool) {
    put_u32(out, value.to_bits(), big_endian);
}

fn put_float_table(out: &mut Vec<u8>, table: &[f32], big_endian: bool) {
    put_u32(out, table.len() as u32, big_endian);
    for &value in table {
        put_f32(out, value, big_endian);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::ModelConfig;
    use crate::lm::loader::BinaryLoader;
    use crate::log_math::LogMath;

    fn three_word_builder() -> ModelBuilder {
        let mut builder = ModelBuilder::new();
        builder.add_unigram("a", -0.5, -0.2);
        builder.add_unigram("b", -0.7, -0.1);
        builder.add_unigram("c", -1.0, 0.0);
        builder.add_bigram("a", "b", -0.3, -0.1).unwrap();
        builder.add_bigram("b", "c", -0.4, -0.2).unwrap();
        builder.add_trigram("a", "b", "c", -0.9).unwrap();
        builder
    }

    #[test]
    fn save_and_reload_round_trip() -> Result<()> {
        for big_endian in [false, true] {
            let file = NamedTempFile::new()?;
            let mut builder = three_word_builder();
            builder.big_endian(big_endian);
            builder.save(file.path())?;

            let log_math = LogMath::default();
            let loader = BinaryLoader::open(file.path(), &ModelConfig::default(), &log_math)?;
            assert_eq!(loader.big_endian(), big_endian);
            assert_eq!(loader.max_depth(), 3);
            assert_eq!(loader.number_unigrams(), 3);
            assert_eq!(loader.number_bigrams(), 2);
            assert_eq!(loader.number_trigrams(), 1);
            assert_eq!(loader.words(), &["a", "b", "c"]);

            let unigram = loader.unigrams()[2];
            assert_eq!(unigram.log_prob, log_math.log10_to_log(-1.0));
            assert_eq!(unigram.word_id, 2);
            assert_eq!(
                loader.bigram_probabilities(),
                &[log_math.log10_to_log(-0.3), log_math.log10_to_log(-0.4)]
            );
            assert_eq!(
                loader.trigram_probabilities(),
                &[log_math.log10_to_log(-0.9)]
            );
            // Followers of "a" start at entry 0, of "b" at entry 1.
            assert_eq!(loader.unigrams()[0].first_bigram_entry, 0);
            assert_eq!(loader.unigrams()[1].first_bigram_entry, 1);
            assert_eq!(loader.unigrams()[2].first_bigram_entry, 2);
        }
        Ok(())
    }

    #[test]
    fn trigram_without_parent_bigram_is_rejected() {
        let mut builder = ModelBuilder::new();
        builder.add_unigram("a", -0.5, -0.2);
        builder.add_unigram("b", -0.7, -0.1);
        builder.add_trigram("a", "a", "b", -0.9).unwrap();
        let file = NamedTempFile::new().unwrap();
        assert!(builder.save(file.path()).is_err());
    }

    #[test]
    fn bigram_over_unknown_word_is_rejected() {
        let mut builder = ModelBuilder::new();
        builder.add_unigram("a", -0.5, -0.2);
        assert!(builder.add_bigram("a", "zzz", -0.3, -0.1).is_err());
    }

    #[test]
    fn unigram_only_model_has_depth_one() -> Result<()> {
        let file = NamedTempFile::new()?;
        let mut builder = ModelBuilder::new();
        builder.add_unigram("a", -0.5, 0.0);
        builder.save(file.path())?;
        let loader =
            BinaryLoader::open(file.path(), &ModelConfig::default(), &LogMath::default())?;
        assert_eq!(loader.max_depth(), 1);
        assert_eq!(loader.number_bigrams(), 0);
        Ok(())
    }

    #[test]
    fn truncated_file_is_rejected() -> Result<()> {
        let file = NamedTempFile::new()?;
        let builder = three_word_builder();
        builder.save(file.path())?;
        let bytes = std::fs::read(file.path())?;
        std::fs::write(file.path(), &bytes[..bytes.len() - 2])?;
        assert!(
            BinaryLoader::open(file.path(), &ModelConfig::default(), &LogMath::default()).is_err()
        );
        Ok(())
    }

    #[test]
    fn bad_magic_is_rejected() -> Result<()> {
        let file = NamedTempFile::new()?;
        std::fs::write(file.path(), b"not a model at all")?;
        assert!(
            BinaryLoader::open(file.path(), &ModelConfig::default(), &LogMath::default()).is_err()
        );
        Ok(())
    }
}
