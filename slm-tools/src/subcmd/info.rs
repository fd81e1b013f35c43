use std::path::Path;

use libslm::config::ModelConfig;
use libslm::lm::loader::BinaryLoader;
use libslm::log_math::LogMath;

pub fn info(model: &str) -> anyhow::Result<()> {
    let loader = BinaryLoader::open(
        Path::new(model),
        &ModelConfig::default(),
        &LogMath::default(),
    )?;
    println!("max depth:       {}", loader.max_depth());
    println!("unigrams:        {}", loader.number_unigrams());
    println!("bigrams:         {}", loader.number_bigrams());
    println!("trigrams:        {}", loader.number_trigrams());
    println!(
        "byte order:      {}-endian",
        if loader.big_endian() { "big" } else { "little" }
    );
    println!(
        "segment size:    {} bigrams",
        1u64 << loader.log_bigram_segment_size()
    );
    println!("bigram section:  offset {}", loader.bigram_offset());
    println!("trigram section: offset {}", loader.trigram_offset());
    println!(
        "prob tables:     {} bigram, {} trigram, {} backoff entries",
        loader.bigram_probabilities().len(),
        loader.trigram_probabilities().len(),
        loader.trigram_backoff_weights().len()
    );
    Ok(())
}
