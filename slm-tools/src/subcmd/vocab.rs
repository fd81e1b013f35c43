use std::path::Path;

use libslm::lm::loader::read_vocabulary;

pub fn vocab(model: &str) -> anyhow::Result<()> {
    for word in read_vocabulary(Path::new(model))? {
        println!("{word}");
    }
    Ok(())
}
