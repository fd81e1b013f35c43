use std::io::{self, BufRead};
use std::path::Path;
use std::rc::Rc;

use anyhow::{bail, Result};
use serde::Serialize;

use libslm::config::ModelConfig;
use libslm::dictionary::{MemoryDictionary, Word, WordResolver};
use libslm::lm::loader::read_vocabulary;
use libslm::lm::{TrigramModel, TrigramModelBuilder};

#[derive(Debug, Serialize)]
struct QueryOutput {
    ngram: String,
    log_probability: f32,
}

pub struct QueryOptions<'a> {
    pub model: &'a str,
    pub text: Option<String>,
    pub apply_weights: bool,
    pub language_weight: f32,
    pub word_insertion_probability: f64,
    pub json_output: bool,
}

pub fn query(opts: QueryOptions) -> Result<()> {
    let path = Path::new(opts.model);
    let dictionary = Rc::new(MemoryDictionary::new(read_vocabulary(path)?));
    let config = ModelConfig {
        apply_language_weight_and_wip: opts.apply_weights,
        language_weight: opts.language_weight,
        word_insertion_probability: opts.word_insertion_probability,
        ..ModelConfig::default()
    };
    let mut model = TrigramModelBuilder::new(path, config).build(dictionary.clone())?;

    model.start();
    match opts.text {
        Some(text) => score_line(&mut model, &dictionary, &text, opts.json_output)?,
        None => {
            for line in io::stdin().lock().lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                score_line(&mut model, &dictionary, &line, opts.json_output)?;
            }
        }
    }
    model.stop();
    Ok(())
}

fn score_line(
    model: &mut TrigramModel<MemoryDictionary>,
    dictionary: &MemoryDictionary,
    line: &str,
    json_output: bool,
) -> Result<()> {
    let mut words: Vec<Word> = Vec::new();
    for spelling in line.split_whitespace() {
        match dictionary.word(spelling) {
            Some(word) => words.push(word),
            None => bail!("word {spelling:?} is not in the model vocabulary"),
        }
    }
    let probability = model.probability(&words)?;
    if json_output {
        let output = QueryOutput {
            ngram: line.trim().to_string(),
            log_probability: probability,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("{probability}\t{}", line.trim());
    }
    Ok(())
}
