use std::path::Path;
use std::rc::Rc;

use libslm::config::ModelConfig;
use libslm::dictionary::MemoryDictionary;
use libslm::lm::loader::read_vocabulary;
use libslm::lm::TrigramModelBuilder;

pub fn smear(model: &str, dst_file: &str) -> anyhow::Result<()> {
    let path = Path::new(model);
    let dictionary = Rc::new(MemoryDictionary::new(read_vocabulary(path)?));
    let config = ModelConfig {
        full_smear: true,
        ..ModelConfig::default()
    };
    let mut model = TrigramModelBuilder::new(path, config).build(dictionary)?;
    model.write_smear_info(Path::new(dst_file))?;
    println!("wrote {dst_file}");
    Ok(())
}
