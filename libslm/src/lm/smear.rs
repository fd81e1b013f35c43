use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use log::{info, warn};
use rustc_hash::FxHashMap;

use crate::dictionary::{Word, WordResolver};
use crate::lm::buffer::BigramRecord;
use crate::lm::trigram_model::TrigramModel;
use crate::log_math::LogMath;

/// Magic tag of the smear sidecar file.
pub(crate) const SMEAR_MAGIC: u32 = 0xC0CA_C01A;

/// Per-history smear terms: one scalar per unigram plus a map keyed by
/// bigram history. The decoder uses them to bound the score contribution of
/// extending a partially specified history.
pub(crate) struct SmearInfo {
    unigram_terms: Vec<f32>,
    bigram_terms: FxHashMap<u64, f32>,
}

impl SmearInfo {
    fn new(number_unigrams: usize) -> SmearInfo {
        SmearInfo {
            // Words without followers keep the log-one term.
            unigram_terms: vec![LogMath::LOG_ONE; number_unigrams],
            bigram_terms: FxHashMap::default(),
        }
    }

    fn key(first: u32, second: u32) -> u64 {
        u64::from(first) << 32 | u64::from(second)
    }

    pub fn unigram_term(&self, word_id: u32) -> f32 {
        self.unigram_terms[word_id as usize]
    }

    fn set_unigram_term(&mut self, word_id: usize, term: f32) {
        self.unigram_terms[word_id] = term;
    }

    pub fn bigram_term(&self, first: u32, second: u32) -> Option<f32> {
        self.bigram_terms.get(&Self::key(first, second)).copied()
    }

    fn put_bigram_term(&mut self, first: u32, second: u32, term: f32) {
        self.bigram_terms.insert(Self::key(first, second), term);
    }

    pub fn bigram_term_count(&self) -> usize {
        self.bigram_terms.len()
    }
}

impl<D: WordResolver> TrigramModel<D> {
    /// Smear term for a history. 1.0 when full smear is disabled or the
    /// history is empty; otherwise the unigram term of the last word, refined
    /// by the bigram term when the two-word history has one.
    pub fn smear(&mut self, words: &[Word]) -> Result<f32> {
        if self.smear.is_none() {
            return Ok(1.0);
        }
        self.smear_count += 1;
        let term = match words.len() {
            0 => Some(1.0),
            1 => {
                let id = self.word_id(words[0])?;
                self.smear.as_ref().map(|info| info.unigram_term(id))
            }
            length => {
                let first = self.word_id(words[length - 2])?;
                let second = self.word_id(words[length - 1])?;
                match self
                    .smear
                    .as_ref()
                    .and_then(|info| info.bigram_term(first, second))
                {
                    Some(term) => {
                        self.smear_bigram_hits += 1;
                        Some(term)
                    }
                    None => self.smear.as_ref().map(|info| info.unigram_term(second)),
                }
            }
        };
        Ok(term.unwrap_or(1.0))
    }

    /// Brings up the smear tables: reads the sidecar when configured and
    /// consistent with the model, otherwise recomputes them.
    pub(crate) fn load_smear_info(&mut self) -> Result<()> {
        let sidecar = self.config.smear_file.clone();
        let smear = match &sidecar {
            Some(path) => match self.read_smear_info(path) {
                Ok(smear) => {
                    info!("smear terms read from {}", path.display());
                    smear
                }
                Err(error) => {
                    warn!("cannot use smear terms in {}: {error:#}", path.display());
                    self.build_smear_info()?
                }
            },
            None => self.build_smear_info()?,
        };
        info!("smear terms cover {} bigram histories", smear.bigram_term_count());
        self.smear = Some(smear);
        Ok(())
    }

    /// Computes unigram and bigram smear terms over the whole model.
    ///
    /// For each predecessor the expectation runs over its tabulated
    /// followers, then closes over the unobserved rest of the vocabulary with
    /// the global sums `s0` and `r0`; the bigram pass reuses the per-word
    /// partial sums of the unigram pass for its own tail terms. All
    /// accumulation is f64, results are stored f32.
    pub(crate) fn build_smear_info(&mut self) -> Result<SmearInfo> {
        let number_unigrams = self.loader.number_unigrams();
        let mut smear = SmearInfo::new(number_unigrams);

        let mut s0 = 0.0f64;
        let mut r0 = 0.0f64;
        for unigram in self.loader.unigrams() {
            let log_prob = f64::from(unigram.log_prob);
            let prob = self.log_math.log_to_linear(unigram.log_prob);
            s0 += prob * log_prob;
            r0 += prob * log_prob * log_prob;
        }

        let mut numerator = vec![0.0f64; number_unigrams];
        let mut denominator = vec![0.0f64; number_unigrams];
        let mut avg_log_prob = vec![0.0f64; number_unigrams];

        for id in 0..number_unigrams {
            let Some(followers) = self.follower_records(id as u32)? else {
                continue;
            };
            let unigram = self.loader.unigrams()[id];
            let log_backoff = unigram.log_backoff;
            let backoff = self.log_math.log_to_linear(log_backoff);
            for record in &followers {
                let log_unigram_prob = self.loader.unigrams()[record.word_id as usize].log_prob;
                let log_bigram_prob = self.bigram_table_probability(record.probability_id)?;
                let unigram_prob = self.log_math.log_to_linear(log_unigram_prob);
                let bigram_prob = self.log_math.log_to_linear(log_bigram_prob);
                let backed_off_prob = backoff * unigram_prob;
                let log_backed_off_prob = self.log_math.linear_to_log(backed_off_prob);
                numerator[id] += (bigram_prob * f64::from(log_bigram_prob)
                    - backed_off_prob * f64::from(log_backed_off_prob))
                    * f64::from(log_unigram_prob);
                denominator[id] += (bigram_prob - backed_off_prob) * f64::from(log_unigram_prob);
            }
            numerator[id] += backoff * (f64::from(log_backoff) * s0 + r0);
            avg_log_prob[id] = denominator[id] + backoff * s0;
            denominator[id] += backoff * r0;
            smear.set_unigram_term(id, (numerator[id] / denominator[id]) as f32);
        }

        for id in 0..number_unigrams {
            let Some(followers) = self.follower_records(id as u32)? else {
                continue;
            };
            for record in followers {
                let second = record.word_id;
                let term = match self.load_trigram_buffer(id as u32, second)? {
                    None => smear.unigram_term(second),
                    Some(trigrams) if trigrams.len() == 0 => smear.unigram_term(second),
                    Some(trigrams) => {
                        let log_bigram_backoff = self.trigram_backoff_weight(record.backoff_id)?;
                        let bigram_backoff = self.log_math.log_to_linear(log_bigram_backoff);
                        let mut bg_numerator = 0.0f64;
                        let mut bg_denominator = 0.0f64;
                        for index in 0..trigrams.len() {
                            let third = trigrams.word_id(index);
                            let log_trigram_prob =
                                self.trigram_table_probability(trigrams.probability_id(index))?;
                            let trigram_prob = self.log_math.log_to_linear(log_trigram_prob);
                            let log_bigram_prob = self.bigram_probability_by_id(second, third)?;
                            let bigram_prob = self.log_math.log_to_linear(log_bigram_prob);
                            let log_unigram_prob =
                                f64::from(self.loader.unigrams()[third as usize].log_prob);
                            let backed_off_prob = bigram_backoff * bigram_prob;
                            let log_backed_off_prob = self.log_math.linear_to_log(backed_off_prob);
                            bg_numerator += (trigram_prob * f64::from(log_trigram_prob)
                                - backed_off_prob * f64::from(log_backed_off_prob))
                                * log_unigram_prob;
                            bg_denominator += (trigram_prob - backed_off_prob)
                                * log_unigram_prob
                                * log_unigram_prob;
                        }
                        bg_numerator += bigram_backoff
                            * (f64::from(log_bigram_backoff) * avg_log_prob[second as usize]
                                - numerator[second as usize]);
                        bg_denominator += bigram_backoff * denominator[second as usize];
                        (bg_numerator / bg_denominator) as f32
                    }
                };
                smear.put_bigram_term(id as u32, second, term);
            }
        }
        Ok(smear)
    }

    /// Reads smear terms from a sidecar, validating them against the model.
    pub(crate) fn read_smear_info(&mut self, path: &Path) -> Result<SmearInfo> {
        let file = File::open(path)
            .with_context(|| format!("cannot open smear file {}", path.display()))?;
        let mut reader = BufReader::new(file);
        ensure!(read_u32(&mut reader)? == SMEAR_MAGIC, "bad smear file magic");
        let number_unigrams = self.loader.number_unigrams();
        let listed_unigrams = read_u32(&mut reader)? as usize;
        ensure!(
            listed_unigrams == number_unigrams,
            "smear file lists {listed_unigrams} unigrams, model has {number_unigrams}"
        );
        let mut smear = SmearInfo::new(number_unigrams);
        for id in 0..number_unigrams {
            let term = read_f32(&mut reader)?;
            smear.set_unigram_term(id, term);
        }
        for id in 0..number_unigrams {
            let listed = read_u32(&mut reader)? as usize;
            let followers = self.number_bigram_followers(id as u32) as usize;
            ensure!(
                listed == followers,
                "smear file lists {listed} followers for unigram {id}, model has {followers}"
            );
            for _ in 0..listed {
                let second = read_u32(&mut reader)?;
                let term = read_f32(&mut reader)?;
                smear.put_bigram_term(id as u32, second, term);
            }
        }
        Ok(smear)
    }

    /// Writes the smear terms next to the model.
    pub fn write_smear_info(&mut self, path: &Path) -> Result<()> {
        let number_unigrams = self.loader.number_unigrams();
        let mut followers = Vec::with_capacity(number_unigrams);
        for id in 0..number_unigrams {
            let ids: Vec<u32> = match self.bigram_buffer(id as u32)? {
                Some(buffer) => (0..buffer.len()).map(|index| buffer.record(index).word_id).collect(),
                None => Vec::new(),
            };
            followers.push(ids);
        }
        let Some(smear) = &self.smear else {
            bail!("no smear terms to write; enable full_smear first");
        };

        let file = File::create(path)
            .with_context(|| format!("cannot create smear file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        write_u32(&mut writer, SMEAR_MAGIC)?;
        write_u32(&mut writer, number_unigrams as u32)?;
        for id in 0..number_unigrams {
            write_f32(&mut writer, smear.unigram_term(id as u32))?;
        }
        for (id, ids) in followers.iter().enumerate() {
            write_u32(&mut writer, ids.len() as u32)?;
            for &second in ids {
                let term = match smear.bigram_term(id as u32, second) {
                    Some(term) => term,
                    None => bail!("missing smear term for bigram ({id}, {second})"),
                };
                write_u32(&mut writer, second)?;
                write_f32(&mut writer, term)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    fn bigram_probability_by_id(&mut self, first_id: u32, second_id: u32) -> Result<f32> {
        let record = match self.bigram_buffer(first_id)? {
            Some(buffer) => buffer.find(second_id),
            None => None,
        };
        match record {
            Some(record) => self.bigram_table_probability(record.probability_id),
            None => bail!(
                "model lists a trigram whose tail bigram ({first_id}, {second_id}) is missing"
            ),
        }
    }

    /// Decoded follower records of one predecessor, `None` when it has none.
    fn follower_records(&mut self, first_id: u32) -> Result<Option<Vec<BigramRecord>>> {
        Ok(self.bigram_buffer(first_id)?.map(|buffer| {
            (0..buffer.len()).map(|index| buffer.record(index)).collect()
        }))
    }
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut raw = [0u8; 4];
    reader.read_exact(&mut raw).context("smear file truncated")?;
    Ok(u32::from_le_bytes(raw))
}

fn read_f32(reader: &mut impl Read) -> Result<f32> {
    Ok(f32::from_bits(read_u32(reader)?))
}

fn write_u32(writer: &mut impl Write, value: u32) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_f32(writer: &mut impl Write, value: f32) -> Result<()> {
    write_u32(writer, value.to_bits())
}
