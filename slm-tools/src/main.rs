use std::io::Write;

use clap::{Parser, Subcommand};

use crate::subcmd::compile::compile;
use crate::subcmd::info::info;
use crate::subcmd::query::{query, QueryOptions};
use crate::subcmd::smear::smear;
use crate::subcmd::vocab::vocab;

mod arpa;
mod subcmd;

#[derive(Debug, Parser)]
#[clap(
name = env ! ("CARGO_PKG_NAME"),
version = env ! ("CARGO_PKG_VERSION"),
about = env ! ("CARGO_PKG_DESCRIPTION"),
arg_required_else_help = true,
)]
struct Args {
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[clap(arg_required_else_help = true)]
    Compile(CompileArgs),
    #[clap(arg_required_else_help = true)]
    Info(InfoArgs),
    #[clap(arg_required_else_help = true)]
    Vocab(VocabArgs),
    #[clap(arg_required_else_help = true)]
    Query(QueryArgs),
    #[clap(arg_required_else_help = true)]
    Smear(SmearArgs),
}

/// Compile an ARPA text model into the packed binary format.
#[derive(Debug, clap::Args)]
struct CompileArgs {
    src_file: String,
    dst_file: String,
    /// Bigrams covered by one trigram segment entry, as a power of two.
    #[arg(long, default_value_t = 9)]
    segment_bits: u32,
    /// Write big-endian records.
    #[arg(long, default_value_t = false)]
    big_endian: bool,
}

/// Print the header counts and geometry of a binary model.
#[derive(Debug, clap::Args)]
struct InfoArgs {
    model: String,
}

/// Dump the model vocabulary, one word per line.
#[derive(Debug, clap::Args)]
struct VocabArgs {
    model: String,
}

/// Score whitespace-separated n-grams from the command line or stdin.
#[derive(Debug, clap::Args)]
struct QueryArgs {
    model: String,
    /// One n-gram; stdin lines are scored when omitted.
    text: Option<String>,
    /// Apply the language weight and word insertion probability at load.
    #[arg(long, default_value_t = false)]
    apply_weights: bool,
    #[arg(long, default_value_t = 1.0)]
    language_weight: f32,
    #[arg(long, default_value_t = 1.0)]
    word_insertion_probability: f64,
    /// Output one JSON object per query.
    #[arg(long, default_value_t = false)]
    json: bool,
}

/// Build the smear sidecar of a model.
#[derive(Debug, clap::Args)]
struct SmearArgs {
    model: String,
    dst_file: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .format(|buf, record| {
            let ts = buf.timestamp_micros();
            writeln!(buf, "{}: {}: {}", ts, record.level(), record.args())
        })
        .init();

    match args.command {
        Commands::Compile(opt) => compile(
            &opt.src_file,
            &opt.dst_file,
            opt.segment_bits,
            opt.big_endian,
        ),
        Commands::Info(opt) => info(&opt.model),
        Commands::Vocab(opt) => vocab(&opt.model),
        Commands::Query(opt) => query(QueryOptions {
            model: &opt.model,
            text: opt.text,
            apply_weights: opt.apply_weights,
            language_weight: opt.language_weight,
            word_insertion_probability: opt.word_insertion_probability,
            json_output: opt.json,
        }),
        Commands::Smear(opt) => smear(&opt.model, &opt.dst_file),
    }
}
