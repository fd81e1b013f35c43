use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{anyhow, bail, ensure, Result};
use log::{info, warn};
use rustc_hash::FxHashMap;

use crate::config::ModelConfig;
use crate::dictionary::{Word, WordResolver};
use crate::lm::base::LanguageModel;
use crate::lm::buffer::{
    BigramBuffer, BigramRecord, TrigramBuffer, BYTES_PER_BIGRAM, BYTES_PER_TRIGRAM,
};
use crate::lm::cache::LruCache;
use crate::lm::loader::{BinaryLoader, UnigramRecord};
use crate::lm::smear::SmearInfo;
use crate::log_math::LogMath;

const START_UTT_MARKER: &str = "<START_UTT>";
const END_UTT_MARKER: &str = "<END_UTT>";

/// Opens a binary model and brings up a [`TrigramModel`]: the resident
/// tables, the word-id map against the caller's dictionary, the probability
/// caches and (when configured) the smear terms.
pub struct TrigramModelBuilder {
    path: PathBuf,
    config: ModelConfig,
    log_math: LogMath,
}

impl TrigramModelBuilder {
    pub fn new(path: impl Into<PathBuf>, config: ModelConfig) -> TrigramModelBuilder {
        TrigramModelBuilder {
            path: path.into(),
            config,
            log_math: LogMath::default(),
        }
    }

    pub fn log_math(&mut self, log_math: LogMath) -> &mut Self {
        self.log_math = log_math;
        self
    }

    pub fn build<D: WordResolver>(&self, resolver: Rc<D>) -> Result<TrigramModel<D>> {
        let query_log = match &self.config.query_log_file {
            Some(path) => Some(BufWriter::new(File::create(path).map_err(|error| {
                anyhow!("cannot create query log {}: {error}", path.display())
            })?)),
            None => None,
        };

        let loader = BinaryLoader::open(&self.path, &self.config, &self.log_math)?;

        let max_depth = if self.config.max_depth == 0 || self.config.max_depth > loader.max_depth()
        {
            loader.max_depth()
        } else {
            self.config.max_depth
        };

        // Model words the dictionary does not know are reported but kept out
        // of the map; queries naming them fail individually later.
        let mut unigram_id_map = FxHashMap::default();
        let mut missing_words = 0usize;
        for (id, spelling) in loader.words().iter().enumerate() {
            match resolver.word(spelling) {
                Some(word) => {
                    unigram_id_map.insert(word, id as u32);
                }
                None => {
                    info!("Missing word: {spelling}");
                    missing_words += 1;
                }
            }
        }
        if missing_words > 0 {
            warn!("dictionary is missing {missing_words} words contained in the language model");
        }

        let number_unigrams = loader.number_unigrams();
        let mut model = TrigramModel {
            config: self.config.clone(),
            log_math: self.log_math.clone(),
            resolver,
            loader,
            max_depth,
            unigram_id_map,
            loaded_bigram_buffers: (0..number_unigrams).map(|_| None).collect(),
            loaded_trigram_buffers: FxHashMap::default(),
            trigram_cache: LruCache::new(self.config.trigram_cache_size),
            bigram_cache: LruCache::new(self.config.bigram_cache_size),
            smear: None,
            query_log,
            bigram_misses: 0,
            trigram_misses: 0,
            trigram_hits: 0,
            smear_count: 0,
            smear_bigram_hits: 0,
        };
        if model.config.full_smear {
            model.load_smear_info()?;
        }
        Ok(model)
    }
}

/// Disk-resident trigram language model with Katz back-off.
///
/// The unigram table and the de-duplicated probability tables stay resident;
/// bigram and trigram follower slices are demand-paged from the file. Bigram
/// slices survive across utterances as long as each utterance touches them,
/// trigram slices live for one utterance, and two insertion-ordered caches
/// short-circuit repeated history lookups. Cache state never changes a
/// returned score, only how fast it comes back.
pub struct TrigramModel<D: WordResolver> {
    pub(crate) config: ModelConfig,
    pub(crate) log_math: LogMath,
    pub(crate) resolver: Rc<D>,
    pub(crate) loader: BinaryLoader,
    pub(crate) max_depth: usize,
    pub(crate) unigram_id_map: FxHashMap<Word, u32>,
    pub(crate) loaded_bigram_buffers: Vec<Option<BigramBuffer>>,
    pub(crate) loaded_trigram_buffers: FxHashMap<(Word, Word), TrigramBuffer>,
    pub(crate) trigram_cache: LruCache<(Word, Word, Word), f32>,
    pub(crate) bigram_cache: LruCache<(Word, Word), BigramRecord>,
    pub(crate) smear: Option<SmearInfo>,
    query_log: Option<BufWriter<File>>,
    bigram_misses: u32,
    trigram_misses: u32,
    trigram_hits: u32,
    pub(crate) smear_count: u32,
    pub(crate) smear_bigram_hits: u32,
}

impl<D: WordResolver> TrigramModel<D> {
    /// Marks the start of an utterance.
    pub fn start(&mut self) {
        self.log_query(START_UTT_MARKER);
    }

    /// Marks the end of an utterance: drops buffers no query has touched
    /// since the previous sweep and, when configured, resets the probability
    /// caches.
    pub fn stop(&mut self) {
        self.sweep_buffers();
        self.log_query(END_UTT_MARKER);
        if let Some(log) = &mut self.query_log {
            if let Err(error) = log.flush() {
                warn!("cannot flush query log: {error}");
            }
        }
    }

    fn sweep_buffers(&mut self) {
        for slot in self.loaded_bigram_buffers.iter_mut() {
            match slot {
                Some(buffer) if buffer.used() => buffer.set_used(false),
                Some(_) => *slot = None,
                None => {}
            }
        }
        self.loaded_trigram_buffers.clear();
        info!(
            "LM cache: 3-g {} 2-g {}",
            self.trigram_cache.len(),
            self.bigram_cache.len()
        );
        if self.config.clear_cache_after_utterance {
            self.trigram_cache.clear();
            self.bigram_cache.clear();
        }
    }

    fn log_query(&mut self, line: &str) {
        if let Some(log) = &mut self.query_log {
            if let Err(error) = writeln!(log, "{line}") {
                warn!("cannot write query log: {error}");
            }
        }
    }

    /// `P(last word | preceding words)` in the host log base. Sequences
    /// longer than the effective depth are a caller error.
    pub fn probability(&mut self, words: &[Word]) -> Result<f32> {
        if self.query_log.is_some() {
            let line = words
                .iter()
                .map(|&word| self.spelling_of(word))
                .collect::<Vec<_>>()
                .join(" ");
            self.log_query(&line);
        }
        match words.len() {
            3 if self.max_depth >= 3 => self.trigram_probability(words),
            2 if self.max_depth >= 2 => self.bigram_probability(words),
            1 => self.unigram_probability(words),
            arity => bail!("unsupported {arity}-gram query (model depth {})", self.max_depth),
        }
    }

    /// The stored back-off weight of the innermost matching context, or
    /// log-one when the context is not tabulated.
    pub fn backoff(&mut self, words: &[Word]) -> Result<f32> {
        match words.len() {
            0 => Ok(LogMath::LOG_ONE),
            1 => Ok(self
                .unigram(words[0])
                .map(|unigram| unigram.log_backoff)
                .unwrap_or(LogMath::LOG_ONE)),
            length => {
                let first = words[length - 2];
                let second = words[length - 1];
                if self.loader.number_trigrams() == 0
                    || !self.has_unigram(first)
                    || !self.has_unigram(second)
                {
                    return Ok(LogMath::LOG_ONE);
                }
                match self.find_bigram(first, second)? {
                    Some(record) => self.trigram_backoff_weight(record.backoff_id),
                    None => Ok(LogMath::LOG_ONE),
                }
            }
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn vocabulary(&self) -> HashSet<String> {
        self.loader.words().iter().cloned().collect()
    }

    /// The model-internal id of a word; words outside the model are fatal.
    pub fn word_id(&self, word: Word) -> Result<u32> {
        match self.unigram_id_map.get(&word) {
            Some(&id) => Ok(id),
            None => bail!("no word id: {}", self.spelling_of(word)),
        }
    }

    pub fn bigram_misses(&self) -> u32 {
        self.bigram_misses
    }

    pub fn trigram_misses(&self) -> u32 {
        self.trigram_misses
    }

    pub fn trigram_hits(&self) -> u32 {
        self.trigram_hits
    }

    pub fn smear_count(&self) -> u32 {
        self.smear_count
    }

    pub fn smear_bigram_hits(&self) -> u32 {
        self.smear_bigram_hits
    }

    pub fn cached_trigram_count(&self) -> usize {
        self.trigram_cache.len()
    }

    pub fn cached_bigram_count(&self) -> usize {
        self.bigram_cache.len()
    }

    pub fn log_math(&self) -> &LogMath {
        &self.log_math
    }

    pub(crate) fn spelling_of(&self, word: Word) -> String {
        self.resolver
            .spelling(word)
            .unwrap_or("<unknown>")
            .to_string()
    }

    fn unigram(&self, word: Word) -> Option<UnigramRecord> {
        self.unigram_id_map
            .get(&word)
            .map(|&id| self.loader.unigrams()[id as usize])
    }

    fn has_unigram(&self, word: Word) -> bool {
        self.unigram_id_map.contains_key(&word)
    }

    fn unigram_probability(&mut self, words: &[Word]) -> Result<f32> {
        match self.unigram(words[0]) {
            Some(unigram) => Ok(unigram.log_prob),
            None => bail!("unigram not in language model: {}", self.spelling_of(words[0])),
        }
    }

    fn bigram_probability(&mut self, words: &[Word]) -> Result<f32> {
        debug_assert_eq!(words.len(), 2);
        if self.loader.number_bigrams() == 0 || !self.has_unigram(words[0]) {
            return self.unigram_probability(&words[1..]);
        }
        if let Some(record) = self.find_bigram(words[0], words[1])? {
            return self.bigram_table_probability(record.probability_id);
        }
        let first = self.unigram(words[0]).ok_or_else(|| {
            anyhow!("unigram not in language model: {}", self.spelling_of(words[0]))
        })?;
        let second = self.unigram(words[1]).ok_or_else(|| {
            anyhow!("unigram not in language model: {}", self.spelling_of(words[1]))
        })?;
        self.bigram_misses += 1;
        Ok(first.log_backoff + second.log_prob)
    }

    fn trigram_probability(&mut self, words: &[Word]) -> Result<f32> {
        debug_assert_eq!(words.len(), 3);
        if self.loader.number_trigrams() == 0 || !self.has_unigram(words[0]) {
            return self.bigram_probability(&words[1..]);
        }
        let key = (words[0], words[1], words[2]);
        if let Some(&probability) = self.trigram_cache.get(&key) {
            return Ok(probability);
        }
        let score = match self.find_trigram(key)? {
            Some(probability_id) => {
                self.trigram_hits += 1;
                self.trigram_table_probability(probability_id)?
            }
            None => {
                self.trigram_misses += 1;
                match self.find_bigram(words[0], words[1])? {
                    Some(record) => {
                        self.trigram_backoff_weight(record.backoff_id)?
                            + self.bigram_probability(&words[1..])?
                    }
                    None => self.bigram_probability(&words[1..])?,
                }
            }
        };
        self.trigram_cache.put(key, score);
        Ok(score)
    }

    /// Finds the bigram record for (first, second), going to the cache first.
    fn find_bigram(&mut self, first: Word, second: Word) -> Result<Option<BigramRecord>> {
        if let Some(&record) = self.bigram_cache.get(&(first, second)) {
            return Ok(Some(record));
        }
        let first_id = self.word_id(first)?;
        let second_id = self.word_id(second)?;
        let found = match self.bigram_buffer(first_id)? {
            Some(buffer) => buffer.find(second_id),
            None => None,
        };
        if let Some(record) = found {
            self.bigram_cache.put((first, second), record);
        }
        Ok(found)
    }

    fn find_trigram(&mut self, key: (Word, Word, Word)) -> Result<Option<u32>> {
        let history = (key.0, key.1);
        if !self.loaded_trigram_buffers.contains_key(&history) {
            let first_id = self.word_id(key.0)?;
            let second_id = self.word_id(key.1)?;
            if let Some(buffer) = self.load_trigram_buffer(first_id, second_id)? {
                self.loaded_trigram_buffers.insert(history, buffer);
            }
        }
        let third_id = self.word_id(key.2)?;
        Ok(self
            .loaded_trigram_buffers
            .get(&history)
            .and_then(|buffer| buffer.find(third_id)))
    }

    /// Demand-loads the follower slice of one predecessor, marking it used.
    /// `None` means the word has no bigram followers.
    pub(crate) fn bigram_buffer(&mut self, first_id: u32) -> Result<Option<&mut BigramBuffer>> {
        let slot = first_id as usize;
        if self.loaded_bigram_buffers[slot].is_none() {
            let followers = self.number_bigram_followers(first_id);
            if followers > 0 {
                let buffer = self.load_bigram_buffer(first_id, followers)?;
                self.loaded_bigram_buffers[slot] = Some(buffer);
            }
        }
        match self.loaded_bigram_buffers[slot].as_mut() {
            Some(buffer) => {
                buffer.set_used(true);
                Ok(Some(buffer))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn number_bigram_followers(&self, word_id: u32) -> u32 {
        let unigrams = self.loader.unigrams();
        let next = match unigrams.get(word_id as usize + 1) {
            Some(next) => next.first_bigram_entry,
            None => self.loader.number_bigrams() as u32,
        };
        next - unigrams[word_id as usize].first_bigram_entry
    }

    fn load_bigram_buffer(&mut self, first_id: u32, followers: u32) -> Result<BigramBuffer> {
        let first_entry = self.loader.unigrams()[first_id as usize].first_bigram_entry;
        let position =
            self.loader.bigram_offset() + u64::from(first_entry) * BYTES_PER_BIGRAM as u64;
        // The extra record is the one right after the slice; its cumulative
        // index closes the trigram range of the last follower.
        let size = (followers as usize + 1) * BYTES_PER_BIGRAM;
        let bytes = self.loader.load_buffer(position, size)?;
        BigramBuffer::new(bytes, followers as usize, self.loader.big_endian())
    }

    /// Reads the trigram followers of the bigram (first, second), locating
    /// the slice through the segment table. `None` when that bigram is not
    /// tabulated.
    pub(crate) fn load_trigram_buffer(
        &mut self,
        first_id: u32,
        second_id: u32,
    ) -> Result<Option<TrigramBuffer>> {
        if self.loader.number_trigrams() == 0 {
            return Ok(None);
        }
        let first_entry = self.loader.unigrams()[first_id as usize].first_bigram_entry;
        let slice = match self.bigram_buffer(first_id)? {
            Some(buffer) => buffer.find(second_id).map(|record| {
                let next = buffer.record(record.which_follower as usize + 1);
                (record, next)
            }),
            None => None,
        };
        let Some((record, next)) = slice else {
            return Ok(None);
        };
        let start = self.first_trigram_entry(&record, first_entry)?;
        let end = self.first_trigram_entry(&next, first_entry)?;
        ensure!(
            end >= start,
            "trigram slice of bigram ({first_id}, {second_id}) has negative length"
        );
        let count = (end - start) as usize;
        let position = self.loader.trigram_offset() + u64::from(start) * BYTES_PER_TRIGRAM as u64;
        let bytes = self.loader.load_buffer(position, count * BYTES_PER_TRIGRAM)?;
        Ok(Some(TrigramBuffer::new(
            bytes,
            count,
            self.loader.big_endian(),
        )?))
    }

    /// Reconstructs the full cumulative trigram index of a bigram record:
    /// segment table base for the record's global position plus the record's
    /// 16-bit intra-segment offset.
    fn first_trigram_entry(&self, record: &BigramRecord, first_bigram_entry: u32) -> Result<u32> {
        let position = first_bigram_entry + record.which_follower;
        let segment = (position >> self.loader.log_bigram_segment_size()) as usize;
        match self.loader.trigram_segments().get(segment) {
            Some(&base) => Ok(base + record.first_trigram_entry),
            None => bail!("bigram position {position} falls outside the trigram segment table"),
        }
    }

    pub(crate) fn bigram_table_probability(&self, probability_id: u32) -> Result<f32> {
        match self.loader.bigram_probabilities().get(probability_id as usize) {
            Some(&probability) => Ok(probability),
            None => bail!("bigram probability id {probability_id} is out of range"),
        }
    }

    pub(crate) fn trigram_table_probability(&self, probability_id: u32) -> Result<f32> {
        match self
            .loader
            .trigram_probabilities()
            .get(probability_id as usize)
        {
            Some(&probability) => Ok(probability),
            None => bail!("trigram probability id {probability_id} is out of range"),
        }
    }

    pub(crate) fn trigram_backoff_weight(&self, backoff_id: u32) -> Result<f32> {
        match self
            .loader
            .trigram_backoff_weights()
            .get(backoff_id as usize)
        {
            Some(&backoff) => Ok(backoff),
            None => bail!("trigram backoff id {backoff_id} is out of range"),
        }
    }
}

impl<D: WordResolver> Drop for TrigramModel<D> {
    fn drop(&mut self) {
        if let Some(log) = &mut self.query_log {
            let _ = log.flush();
        }
    }
}

impl<D: WordResolver> LanguageModel for TrigramModel<D> {
    fn start(&mut self) {
        TrigramModel::start(self);
    }

    fn stop(&mut self) {
        TrigramModel::stop(self);
    }

    fn probability(&mut self, words: &[Word]) -> Result<f32> {
        TrigramModel::probability(self, words)
    }

    fn backoff(&mut self, words: &[Word]) -> Result<f32> {
        TrigramModel::backoff(self, words)
    }

    fn smear(&mut self, words: &[Word]) -> Result<f32> {
        TrigramModel::smear(self, words)
    }

    fn max_depth(&self) -> usize {
        TrigramModel::max_depth(self)
    }

    fn vocabulary(&self) -> HashSet<String> {
        TrigramModel::vocabulary(self)
    }
}
