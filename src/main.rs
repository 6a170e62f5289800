//! Command line front end: render a method dump as annotated listings.

use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use jit_listing::decoder::AssemblySyntax;
use jit_listing::dump::DumpFile;
use jit_listing::format::OutputFormat;
use jit_listing::job::{self, FilenameFormat, JobOptions};
use jit_listing::render::RenderOptions;

#[derive(Parser, Debug)]
#[command(name = "jit-listing", version, about)]
struct Args {
    /// Method dump file (JSON)
    dump: PathBuf,

    /// Write one file per method into this directory instead of stdout
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// How per-method files are named
    #[arg(long, value_enum, default_value = "method-name")]
    filename_format: FilenameFormat,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Assembly syntax
    #[arg(long, value_enum, default_value = "intel")]
    syntax: AssemblySyntax,

    /// Mask run-specific addresses and hide the address and byte columns
    #[arg(long, default_value_t = false)]
    diffable: bool,

    /// Hide the address column
    #[arg(long, default_value_t = false)]
    no_addr: bool,

    /// Hide the raw instruction bytes
    #[arg(long, default_value_t = false)]
    no_bytes: bool,

    /// Do not interleave source statements
    #[arg(long, default_value_t = false)]
    no_source: bool,

    /// Base directory for relative source paths (defaults to the dump's directory)
    #[arg(long)]
    source_root: Option<PathBuf>,

    /// Only render methods whose name contains PATTERN (repeatable)
    #[arg(short, long = "method", value_name = "PATTERN")]
    methods: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let dump = DumpFile::load(&args.dump)
        .with_context(|| format!("load method dump {}", args.dump.display()))?;

    let render = RenderOptions {
        show_addresses: !args.no_addr,
        show_bytes: !args.no_bytes,
        show_source: !args.no_source,
        diffable: args.diffable,
    };
    let options = JobOptions {
        syntax: args.syntax,
        format: args.format,
        output_dir: args.output_dir,
        filename_format: args.filename_format,
        method_filters: args.methods,
        source_root: args.source_root,
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let summary = job::run(&dump, render, &options, &mut out).context("render listings")?;

    for path in &summary.files {
        eprintln!("wrote {}", path.display());
    }
    if !summary.failed.is_empty() {
        bail!(
            "{} of {} methods failed to render: {}",
            summary.failed.len(),
            summary.failed.len() + summary.rendered,
            summary.failed.join(", ")
        );
    }
    Ok(())
}
