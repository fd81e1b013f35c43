//! Reader for the ARPA n-gram text format, orders 1 through 3.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};

#[derive(Debug, Default)]
pub struct ArpaModel {
    /// (word, log10 prob, log10 backoff)
    pub unigrams: Vec<(String, f32, f32)>,
    /// (w1, w2, log10 prob, log10 backoff)
    pub bigrams: Vec<(String, String, f32, f32)>,
    /// (w1, w2, w3, log10 prob)
    pub trigrams: Vec<(String, String, String, f32)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    Preamble,
    Counts,
    NGrams(usize),
    Done,
}

pub fn read_arpa(path: &Path) -> Result<ArpaModel> {
    let file =
        File::open(path).with_context(|| format!("cannot open ARPA file {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut model = ArpaModel::default();
    let mut declared = [0usize; 3];
    let mut section = Section::Preamble;

    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "\\data\\" => {
                section = Section::Counts;
                continue;
            }
            "\\1-grams:" => {
                section = Section::NGrams(1);
                continue;
            }
            "\\2-grams:" => {
                section = Section::NGrams(2);
                continue;
            }
            "\\3-grams:" => {
                section = Section::NGrams(3);
                continue;
            }
            "\\end\\" => {
                section = Section::Done;
                continue;
            }
            _ => {}
        }
        match section {
            Section::Preamble => {}
            Section::Done => bail!("line {}: content after \\end\\", number + 1),
            Section::Counts => {
                let Some(rest) = line.strip_prefix("ngram ") else {
                    bail!("line {}: expected an ngram count, got {line:?}", number + 1);
                };
                let (order, count) = rest
                    .split_once('=')
                    .with_context(|| format!("line {}: malformed ngram count", number + 1))?;
                let order: usize = order.trim().parse()?;
                ensure!(
                    (1..=3).contains(&order),
                    "line {}: unsupported ngram order {order}",
                    number + 1
                );
                declared[order - 1] = count.trim().parse()?;
            }
            Section::NGrams(order) => {
                parse_entry(&mut model, order, line)
                    .with_context(|| format!("line {}: bad {order}-gram entry", number + 1))?;
            }
        }
    }
    ensure!(section == Section::Done, "missing \\end\\ marker");
    ensure!(
        model.unigrams.len() == declared[0],
        "declared {} unigrams, found {}",
        declared[0],
        model.unigrams.len()
    );
    ensure!(
        model.bigrams.len() == declared[1],
        "declared {} bigrams, found {}",
        declared[1],
        model.bigrams.len()
    );
    ensure!(
        model.trigrams.len() == declared[2],
        "declared {} trigrams, found {}",
        declared[2],
        model.trigrams.len()
    );
    Ok(model)
}

fn parse_entry(model: &mut ArpaModel, order: usize, line: &str) -> Result<()> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    ensure!(
        fields.len() == order + 1 || fields.len() == order + 2,
        "expected {} or {} fields, got {}",
        order + 1,
        order + 2,
        fields.len()
    );
    let probability: f32 = fields[0].parse()?;
    let backoff: f32 = if fields.len() == order + 2 {
        fields[order + 1].parse()?
    } else {
        0.0
    };
    match order {
        1 => model
            .unigrams
            .push((fields[1].to_string(), probability, backoff)),
        2 => model.bigrams.push((
            fields[1].to_string(),
            fields[2].to_string(),
            probability,
            backoff,
        )),
        3 => model.trigrams.push((
            fields[1].to_string(),
            fields[2].to_string(),
            fields[3].to_string(),
            probability,
        )),
        _ => bail!("unsupported order {order}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    const SAMPLE: &str = "\
\\data\\
ngram 1=3
ngram 2=2
ngram 3=1

\\1-grams:
-0.5 a -0.2
-0.7 b -0.1
-1.0 c

\\2-grams:
-0.3 a b -0.1
-0.4 b c

\\3-grams:
-0.9 a b c

\\end\\
";

    #[test]
    fn reads_a_small_model() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(SAMPLE.as_bytes())?;
        let model = read_arpa(file.path())?;
        assert_eq!(model.unigrams.len(), 3);
        assert_eq!(model.unigrams[0], ("a".to_string(), -0.5, -0.2));
        assert_eq!(model.unigrams[2], ("c".to_string(), -1.0, 0.0));
        assert_eq!(
            model.bigrams[0],
            ("a".to_string(), "b".to_string(), -0.3, -0.1)
        );
        assert_eq!(
            model.trigrams[0],
            ("a".to_string(), "b".to_string(), "c".to_string(), -0.9)
        );
        Ok(())
    }

    #[test]
    fn rejects_count_mismatch() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(SAMPLE.replace("ngram 2=2", "ngram 2=5").as_bytes())?;
        assert!(read_arpa(file.path()).is_err());
        Ok(())
    }

    #[test]
    fn rejects_a_file_without_end_marker() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(SAMPLE.replace("\\end\\", "").as_bytes())?;
        assert!(read_arpa(file.path()).is_err());
        Ok(())
    }
}
