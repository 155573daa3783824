use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gc_timeline::{convert, default_output_path, Extension, RuleExtension};

/// Format a GC probe log captured with bpftrace into a JSON trace suitable
/// for Perfetto UI.
#[derive(Debug, Parser)]
#[command(name = "gc-timeline")]
#[command(version)]
struct Command {
    /// Log produced by the capture script.
    input: PathBuf,
    /// JSON rule file describing extra event and meta vocabulary.
    #[arg(short, long)]
    extension: Option<PathBuf>,
    /// Output path, defaults to `<INPUT>.json.gz`.
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let opts = Command::parse();
    init_logging(opts.verbose);

    let extension = match &opts.extension {
        Some(path) => Some(Box::new(RuleExtension::load(path)?) as Box<dyn Extension>),
        None => None,
    };
    let output = opts
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&opts.input));

    convert(&opts.input, &output, extension)?;
    Ok(())
}
