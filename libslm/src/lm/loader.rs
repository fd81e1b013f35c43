use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use log::info;

use crate::config::ModelConfig;
use crate::lm::buffer::{BYTES_PER_BIGRAM, BYTES_PER_TRIGRAM};
use crate::log_math::LogMath;

/// The ASCII tag `slm3`, stored as a u32 in the file's byte order. Reading
/// the byte-swapped value tells the loader the file is the other endianness.
pub(crate) const MODEL_MAGIC: u32 = u32::from_le_bytes(*b"slm3");
/// Format version this loader understands.
pub(crate) const FORMAT_VERSION: u32 = 1;

const HEADER_WORDS: usize = 9;
/// Header size in bytes.
pub(crate) const HEADER_BYTES: u64 = (HEADER_WORDS * 4) as u64;

const MAX_WORD_BYTES: usize = 1024;

/// One in-memory unigram entry. Probabilities are already converted to the
/// host log base and carry the configured load-time weights.
#[derive(Debug, Clone, Copy)]
pub struct UnigramRecord {
    pub log_prob: f32,
    pub log_backoff: f32,
    /// Cumulative index of this word's first follower in the global bigram
    /// array. Monotone over word ids.
    pub first_bigram_entry: u32,
    pub word_id: u32,
}

/// Opens a packed binary n-gram model, holds every fully resident table and
/// serves random-access byte ranges of the bigram and trigram sections.
///
/// The on-disk probabilities are log10; the loader converts them to the host
/// log base once. When `apply_language_weight_and_wip` is set, probabilities
/// additionally become `lw * p + log(wip)` and back-off weights `lw * b`,
/// which keeps the back-off identity `P(w|h) = b(h) + P(w|h')` intact under
/// the scaling.
pub struct BinaryLoader {
    file: File,
    big_endian: bool,
    max_depth: usize,
    number_unigrams: usize,
    number_bigrams: usize,
    number_trigrams: usize,
    log_bigram_segment_size: u32,
    bigram_offset: u64,
    trigram_offset: u64,
    words: Vec<String>,
    unigrams: Vec<UnigramRecord>,
    bigram_prob_table: Vec<f32>,
    trigram_prob_table: Vec<f32>,
    trigram_backoff_table: Vec<f32>,
    trigram_segment_table: Vec<u32>,
}

impl BinaryLoader {
    pub fn open(path: &Path, config: &ModelConfig, log_math: &LogMath) -> Result<BinaryLoader> {
        ensure!(
            config.unigram_weight > 0.0 && config.unigram_weight <= 1.0,
            "unigram weight {} is outside (0, 1]",
            config.unigram_weight
        );

        let file = File::open(path)
            .with_context(|| format!("cannot open model file {}", path.display()))?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut raw = [0u8; 4];
        reader
            .read_exact(&mut raw)
            .context("model file truncated in header")?;
        let big_endian = if u32::from_le_bytes(raw) == MODEL_MAGIC {
            false
        } else if u32::from_be_bytes(raw) == MODEL_MAGIC {
            true
        } else {
            bail!("{} is not a binary n-gram model (bad magic)", path.display());
        };

        let version = read_u32(&mut reader, big_endian)?;
        ensure!(
            version == FORMAT_VERSION,
            "unsupported model format version {version}"
        );
        let max_depth = read_u32(&mut reader, big_endian)? as usize;
        ensure!(
            (1..=3).contains(&max_depth),
            "model depth {max_depth} is out of range"
        );
        let number_unigrams = read_u32(&mut reader, big_endian)? as usize;
        ensure!(number_unigrams > 0, "model has no unigrams");
        let number_bigrams = read_u32(&mut reader, big_endian)? as usize;
        let number_trigrams = read_u32(&mut reader, big_endian)? as usize;
        let log_bigram_segment_size = read_u32(&mut reader, big_endian)?;
        ensure!(
            log_bigram_segment_size < 32,
            "bigram segment size exponent {log_bigram_segment_size} is out of range"
        );
        let bigram_offset = u64::from(read_u32(&mut reader, big_endian)?);
        let trigram_offset = u64::from(read_u32(&mut reader, big_endian)?);

        let mut words = Vec::with_capacity(number_unigrams);
        for index in 0..number_unigrams {
            let length = read_u32(&mut reader, big_endian)? as usize;
            ensure!(
                length <= MAX_WORD_BYTES,
                "word {index} is {length} bytes long"
            );
            let mut raw = vec![0u8; length];
            reader
                .read_exact(&mut raw)
                .context("model file truncated in word list")?;
            words.push(
                String::from_utf8(raw)
                    .with_context(|| format!("word {index} is not valid UTF-8"))?,
            );
        }

        let apply_weights = config.apply_language_weight_and_wip;
        let language_weight = config.language_weight;
        let log_wip = log_math.linear_to_log(config.word_insertion_probability);

        let mut unigrams = Vec::with_capacity(number_unigrams);
        let mut previous_entry = 0u32;
        for index in 0..number_unigrams {
            let mut log_prob = log_math.log10_to_log(read_f32(&mut reader, big_endian)?);
            let mut log_backoff = log_math.log10_to_log(read_f32(&mut reader, big_endian)?);
            let first_bigram_entry = read_u32(&mut reader, big_endian)?;
            let word_id = read_u32(&mut reader, big_endian)?;
            ensure!(
                first_bigram_entry >= previous_entry,
                "first bigram entry goes backwards at unigram {index}"
            );
            ensure!(
                first_bigram_entry as usize <= number_bigrams,
                "first bigram entry of unigram {index} exceeds the bigram count"
            );
            ensure!(
                (word_id as usize) < number_unigrams,
                "unigram {index} carries word id {word_id}"
            );
            if apply_weights {
                log_prob = log_prob * language_weight + log_wip;
                log_backoff *= language_weight;
            }
            previous_entry = first_bigram_entry;
            unigrams.push(UnigramRecord {
                log_prob,
                log_backoff,
                first_bigram_entry,
                word_id,
            });
        }
        apply_unigram_weight(&mut unigrams, config.unigram_weight, log_math);

        let mut bigram_prob_table = read_float_table(&mut reader, big_endian, log_math)?;
        let mut trigram_prob_table = read_float_table(&mut reader, big_endian, log_math)?;
        let mut trigram_backoff_table = read_float_table(&mut reader, big_endian, log_math)?;
        if apply_weights {
            for probability in bigram_prob_table
                .iter_mut()
                .chain(trigram_prob_table.iter_mut())
            {
                *probability = *probability * language_weight + log_wip;
            }
            for backoff in trigram_backoff_table.iter_mut() {
                *backoff *= language_weight;
            }
        }

        let segment_table_len = read_u32(&mut reader, big_endian)? as usize;
        if number_trigrams > 0 {
            ensure!(
                segment_table_len > number_bigrams >> log_bigram_segment_size,
                "trigram segment table is too short"
            );
        }
        let mut trigram_segment_table = Vec::with_capacity(segment_table_len);
        for index in 0..segment_table_len {
            let entry = read_u32(&mut reader, big_endian)?;
            ensure!(
                entry as usize <= number_trigrams,
                "segment table entry {index} exceeds the trigram count"
            );
            trigram_segment_table.push(entry);
        }

        // The packed sections must line up with the header geometry; anything
        // else means a truncated or rewritten file.
        let header_end = reader.stream_position()?;
        ensure!(
            header_end == bigram_offset,
            "bigram section starts at {bigram_offset}, tables end at {header_end}"
        );
        let bigram_section = if number_bigrams > 0 {
            ((number_bigrams + 1) * BYTES_PER_BIGRAM) as u64
        } else {
            0
        };
        ensure!(
            trigram_offset == bigram_offset + bigram_section,
            "bigram section size mismatch (missing sentinel record?)"
        );
        ensure!(
            file_len == trigram_offset + (number_trigrams * BYTES_PER_TRIGRAM) as u64,
            "model file length disagrees with the trigram count"
        );

        info!(
            "{}: {} unigrams, {} bigrams, {} trigrams, depth {}, {}-endian",
            path.display(),
            number_unigrams,
            number_bigrams,
            number_trigrams,
            max_depth,
            if big_endian { "big" } else { "little" },
        );

        Ok(BinaryLoader {
            file: reader.into_inner(),
            big_endian,
            max_depth,
            number_unigrams,
            number_bigrams,
            number_trigrams,
            log_bigram_segment_size,
            bigram_offset,
            trigram_offset,
            words,
            unigrams,
            bigram_prob_table,
            trigram_prob_table,
            trigram_backoff_table,
            trigram_segment_table,
        })
    }

    /// One random-access read of the packed n-gram sections. I/O failures
    /// here abort the query that needed the bytes.
    pub fn load_buffer(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; length];
        self.file.read_exact(&mut buffer).with_context(|| {
            format!("cannot read {length} bytes at offset {offset} of the model file")
        })?;
        Ok(buffer)
    }

    pub fn big_endian(&self) -> bool {
        self.big_endian
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn number_unigrams(&self) -> usize {
        self.number_unigrams
    }

    pub fn number_bigrams(&self) -> usize {
        self.number_bigrams
    }

    pub fn number_trigrams(&self) -> usize {
        self.number_trigrams
    }

    pub fn log_bigram_segment_size(&self) -> u32 {
        self.log_bigram_segment_size
    }

    pub fn bigram_offset(&self) -> u64 {
        self.bigram_offset
    }

    pub fn trigram_offset(&self) -> u64 {
        self.trigram_offset
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn unigrams(&self) -> &[UnigramRecord] {
        &self.unigrams
    }

    pub fn bigram_probabilities(&self) -> &[f32] {
        &self.bigram_prob_table
    }

    pub fn trigram_probabilities(&self) -> &[f32] {
        &self.trigram_prob_table
    }

    pub fn trigram_backoff_weights(&self) -> &[f32] {
        &self.trigram_backoff_table
    }

    pub fn trigram_segments(&self) -> &[u32] {
        &self.trigram_segment_table
    }
}

/// Reads just the word list of a model, in model order.
pub fn read_vocabulary(path: &Path) -> Result<Vec<String>> {
    let loader = BinaryLoader::open(path, &ModelConfig::default(), &LogMath::default())?;
    Ok(loader.words)
}

/// Interpolates every unigram with the uniform distribution:
/// `p' = logadd(p + log(uw), log(1/N) + log(1 - uw))`.
fn apply_unigram_weight(unigrams: &mut [UnigramRecord], unigram_weight: f32, log_math: &LogMath) {
    let log_weight = log_math.linear_to_log(f64::from(unigram_weight));
    let log_remainder = log_math.linear_to_log(f64::from(1.0 - unigram_weight));
    let log_uniform = log_math.linear_to_log(1.0 / unigrams.len() as f64);
    for unigram in unigrams.iter_mut() {
        unigram.log_prob = log_math.add_as_linear(
            unigram.log_prob + log_weight,
            log_uniform + log_remainder,
        );
    }
}

fn read_float_table(
    reader: &mut impl Read,
    big_endian: bool,
    log_math: &LogMath,
) -> Result<Vec<f32>> {
    let length = read_u32(reader, big_endian)? as usize;
    ensure!(
        length <= usize::from(u16::MAX) + 1,
        "probability table has {length} entries, more than records can index"
    );
    let mut table = Vec::with_capacity(length);
    for _ in 0..length {
        table.push(log_math.log10_to_log(read_f32(reader, big_endian)?));
    }
    Ok(table)
}

fn read_u32(reader: &mut impl Read, big_endian: bool) -> Result<u32> {
    let mut raw = [0u8; 4];
    reader
        .read_exact(&mut raw)
        .context("model file truncated")?;
    Ok(if big_endian {
        u32::from_be_bytes(raw)
    } else {
        u32::from_le_bytes(raw)
    })
}

fn read_f32(reader: &mut impl Read, big_endian: bool) -> Result<f32> {
    Ok(f32::from_bits(read_u32(reader, big_endian)?))
}
