use std::path::Path;

use log::info;

use libslm::lm::builder::ModelBuilder;

use crate::arpa::read_arpa;

pub fn compile(
    src_file: &str,
    dst_file: &str,
    segment_bits: u32,
    big_endian: bool,
) -> anyhow::Result<()> {
    let arpa = read_arpa(Path::new(src_file))?;
    info!(
        "{src_file}: {} unigrams, {} bigrams, {} trigrams",
        arpa.unigrams.len(),
        arpa.bigrams.len(),
        arpa.trigrams.len()
    );

    let mut builder = ModelBuilder::new();
    builder
        .log_bigram_segment_size(segment_bits)
        .big_endian(big_endian);
    for (word, probability, backoff) in &arpa.unigrams {
        builder.add_unigram(word, *probability, *backoff);
    }
    for (first, second, probability, backoff) in &arpa.bigrams {
        builder.add_bigram(first, second, *probability, *backoff)?;
    }
    for (first, second, third, probability) in &arpa.trigrams {
        builder.add_trigram(first, second, third, *probability)?;
    }
    builder.save(Path::new(dst_file))?;
    println!("wrote {dst_file}");
    Ok(())
}
