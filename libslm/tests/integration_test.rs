use std::fs;
use std::rc::Rc;

use tempfile::NamedTempFile;

use libslm::config::ModelConfig;
use libslm::dictionary::{MemoryDictionary, Word, WordResolver};
use libslm::lm::base::LanguageModel;
use libslm::lm::builder::ModelBuilder;
use libslm::lm::{TrigramModel, TrigramModelBuilder};
use libslm::log_math::LogMath;

/// Trigram model over {a, b, c}: one tabulated trigram (a b c), one bigram
/// history (b c) with no trigram followers, and c with no followers at all.
fn trigram_builder() -> ModelBuilder {
    let mut builder = ModelBuilder::new();
    builder.add_unigram("a", -0.5, -0.2);
    builder.add_unigram("b", -0.7, -0.1);
    builder.add_unigram("c", -1.0, 0.0);
    builder.add_bigram("a", "b", -0.30103, -0.1).unwrap();
    builder.add_bigram("b", "c", -0.4, -0.2).unwrap();
    builder.add_trigram("a", "b", "c", -0.9).unwrap();
    builder
}

fn dictionary() -> Rc<MemoryDictionary> {
    Rc::new(MemoryDictionary::new(["a", "b", "c"]))
}

fn open(
    builder: &ModelBuilder,
    config: ModelConfig,
) -> (NamedTempFile, Rc<MemoryDictionary>, TrigramModel<MemoryDictionary>) {
    let file = NamedTempFile::new().unwrap();
    builder.save(file.path()).unwrap();
    let dictionary = dictionary();
    let model = TrigramModelBuilder::new(file.path(), config)
        .build(dictionary.clone())
        .unwrap();
    (file, dictionary, model)
}

fn words(dictionary: &MemoryDictionary, spellings: &[&str]) -> Vec<Word> {
    spellings
        .iter()
        .map(|spelling| dictionary.word(spelling).unwrap())
        .collect()
}

#[test]
fn byte_order_does_not_change_any_score() {
    let queries: &[&[&str]] = &[
        &["a"],
        &["b"],
        &["c"],
        &["a", "b"],
        &["a", "c"],
        &["b", "c"],
        &["a", "b", "c"],
        &["a", "b", "a"],
        &["b", "c", "a"],
    ];
    let mut little = trigram_builder();
    little.big_endian(false);
    let mut big = trigram_builder();
    big.big_endian(true);

    let (_f1, d1, mut m1) = open(&little, ModelConfig::default());
    let (_f2, d2, mut m2) = open(&big, ModelConfig::default());
    for query in queries {
        let p1 = m1.probability(&words(&d1, query)).unwrap();
        let p2 = m2.probability(&words(&d2, query)).unwrap();
        assert_eq!(p1, p2, "{query:?}");
    }
}

#[test]
fn identical_query_streams_are_deterministic() {
    let builder = trigram_builder();
    let (_f1, d1, mut m1) = open(&builder, ModelConfig::default());
    let (_f2, d2, mut m2) = open(&builder, ModelConfig::default());

    // Different interleavings and cache histories, same answers.
    let warmup = words(&d2, &["a", "b", "c"]);
    m2.start();
    m2.probability(&warmup).unwrap();
    m2.stop();

    for query in [&["a", "b", "c"][..], &["a", "c"][..], &["a", "b", "c"][..]] {
        m1.start();
        let p1 = m1.probability(&words(&d1, query)).unwrap();
        m1.stop();
        m2.start();
        let p2 = m2.probability(&words(&d2, query)).unwrap();
        m2.stop();
        assert_eq!(p1, p2, "{query:?}");
    }
}

#[test]
fn conditional_distributions_stay_normalized() {
    // Exact Katz mass bookkeeping: P(b | a) = 0.5 is tabulated, the other
    // followers of "a" share the remaining half through the back-off weight
    // 0.5 / (P(a) + P(c)) = 0.714286. "b" and "c" back off with weight one.
    let mut builder = ModelBuilder::new();
    builder.add_unigram("a", -0.397940, -0.146128);
    builder.add_unigram("b", -0.522879, 0.0);
    builder.add_unigram("c", -0.522879, 0.0);
    builder.add_bigram("a", "b", -0.301030, 0.0).unwrap();

    let (_file, dictionary, mut model) = open(&builder, ModelConfig::default());
    let log_math = model.log_math().clone();
    let vocabulary = ["a", "b", "c"];
    for history in vocabulary {
        let mut total = 0.0f64;
        for word in vocabulary {
            let query = words(&dictionary, &[history, word]);
            total += log_math.log_to_linear(model.probability(&query).unwrap());
        }
        assert!(
            (total - 1.0).abs() < 1e-3,
            "sum over P(. | {history}) is {total}"
        );
    }
}

#[test]
fn language_weight_and_wip_scale_every_tabulated_probability() {
    let log_math = LogMath::default();
    // A word insertion probability whose log is exactly -1 in the host base.
    let wip = log_math.log_to_linear(-1.0);
    let config = ModelConfig {
        apply_language_weight_and_wip: true,
        language_weight: 0.5,
        word_insertion_probability: wip,
        ..ModelConfig::default()
    };
    let builder = trigram_builder();
    let (_file, dictionary, mut model) = open(&builder, config);

    let raw_bigram = log_math.log10_to_log(-0.30103);
    let got = model.probability(&words(&dictionary, &["a", "b"])).unwrap();
    assert!((got - (0.5 * raw_bigram - 1.0)).abs() < 1e-2, "{got}");

    let raw_unigram = log_math.log10_to_log(-1.0);
    let got = model.probability(&words(&dictionary, &["c"])).unwrap();
    assert!((got - (0.5 * raw_unigram - 1.0)).abs() < 1e-2, "{got}");

    // Backed-off bigram: scaled backoff plus the scaled unigram estimate.
    let raw_backoff = log_math.log10_to_log(-0.2);
    let got = model.probability(&words(&dictionary, &["a", "c"])).unwrap();
    assert!(
        (got - (0.5 * raw_backoff + 0.5 * raw_unigram - 1.0)).abs() < 1e-2,
        "{got}"
    );
}

#[test]
fn query_log_brackets_each_utterance() {
    let log_file = NamedTempFile::new().unwrap();
    let config = ModelConfig {
        query_log_file: Some(log_file.path().to_path_buf()),
        ..ModelConfig::default()
    };
    let builder = trigram_builder();
    let (_file, dictionary, mut model) = open(&builder, config);

    model.start();
    model.probability(&words(&dictionary, &["a"])).unwrap();
    model
        .probability(&words(&dictionary, &["a", "b", "c"]))
        .unwrap();
    model.stop();

    let logged = fs::read_to_string(log_file.path()).unwrap();
    assert_eq!(logged, "<START_UTT>\na\na b c\n<END_UTT>\n");
}

#[test]
fn smear_terms_fall_back_for_unseen_histories() {
    let config = ModelConfig {
        full_smear: true,
        ..ModelConfig::default()
    };
    let builder = trigram_builder();
    let (_file, dictionary, mut model) = open(&builder, config);

    // "c" has no bigram followers, so its term is log one.
    let c = words(&dictionary, &["c"]);
    assert_eq!(model.smear(&c).unwrap(), 0.0);
    // (a, c) is not a tabulated bigram; the term falls back to the unigram's.
    let ac = words(&dictionary, &["a", "c"]);
    assert_eq!(model.smear(&ac).unwrap(), 0.0);
    assert_eq!(model.smear_bigram_hits(), 0);

    // (a, b) is tabulated, so its bigram term answers directly.
    let ab = words(&dictionary, &["a", "b"]);
    let term = model.smear(&ab).unwrap();
    assert!(term.is_finite());
    assert_eq!(model.smear_bigram_hits(), 1);
    assert_eq!(model.smear_count(), 3);

    // (b, c) is tabulated but has no trigram followers; its term equals the
    // unigram term of "c".
    let bc = words(&dictionary, &["b", "c"]);
    assert_eq!(model.smear(&bc).unwrap(), 0.0);

    assert_eq!(model.smear(&[]).unwrap(), 1.0);
}

#[test]
fn smear_is_inert_unless_enabled() {
    let builder = trigram_builder();
    let (_file, dictionary, mut model) = open(&builder, ModelConfig::default());
    let ab = words(&dictionary, &["a", "b"]);
    assert_eq!(model.smear(&ab).unwrap(), 1.0);
    assert_eq!(model.smear_count(), 0);
}

#[test]
fn smear_sidecar_round_trips_bit_exactly() {
    let builder = trigram_builder();
    let (model_file, dictionary, mut built) = open(
        &builder,
        ModelConfig {
            full_smear: true,
            ..ModelConfig::default()
        },
    );

    let sidecar = NamedTempFile::new().unwrap();
    built.write_smear_info(sidecar.path()).unwrap();

    let mut reread = TrigramModelBuilder::new(
        model_file.path(),
        ModelConfig {
            full_smear: true,
            smear_file: Some(sidecar.path().to_path_buf()),
            ..ModelConfig::default()
        },
    )
    .build(dictionary.clone())
    .unwrap();

    for query in [&["a"][..], &["b"][..], &["c"][..], &["a", "b"][..], &["b", "c"][..]] {
        let sequence = words(&dictionary, query);
        assert_eq!(
            built.smear(&sequence).unwrap(),
            reread.smear(&sequence).unwrap(),
            "{query:?}"
        );
    }
}

#[test]
fn inconsistent_sidecar_falls_back_to_a_rebuild() {
    let sidecar = NamedTempFile::new().unwrap();
    fs::write(sidecar.path(), b"garbage, not smear data").unwrap();

    let builder = trigram_builder();
    let (model_file, dictionary, mut reference) = open(
        &builder,
        ModelConfig {
            full_smear: true,
            ..ModelConfig::default()
        },
    );
    let mut model = TrigramModelBuilder::new(
        model_file.path(),
        ModelConfig {
            full_smear: true,
            smear_file: Some(sidecar.path().to_path_buf()),
            ..ModelConfig::default()
        },
    )
    .build(dictionary.clone())
    .unwrap();

    let ab = words(&dictionary, &["a", "b"]);
    assert_eq!(model.smear(&ab).unwrap(), reference.smear(&ab).unwrap());
}

#[test]
fn the_engine_serves_the_language_model_trait() {
    let builder = trigram_builder();
    let (_file, dictionary, model) = open(&builder, ModelConfig::default());
    let mut model: Box<dyn LanguageModel> = Box::new(model);

    model.start();
    let sequence = words(&dictionary, &["a", "b"]);
    let probability = model.probability(&sequence).unwrap();
    assert!(probability < 0.0);
    assert_eq!(model.max_depth(), 3);
    assert_eq!(model.vocabulary().len(), 3);
    model.stop();
}
