//! dscmap - maps the layout of dyld shared caches and Mach-O images.
//!
//! Decodes a cache (or a standalone Mach-O file) into a checked block tree,
//! prints a summary and optionally writes the tree as JSON.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dscmap::tree::{load, save};
use dscmap::{
    decode_cache, decode_macho, Block, DecodeOptions, Fetcher, FileSource, Finder, MachOFile, MemorySource, Source,
    TargetOs,
};

/// Maps dyld shared caches into a verified tree of address-ranged blocks.
#[derive(Parser, Debug)]
#[command(name = "dscmap")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity (-v warnings, -vv info, -vvv debug); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode a cache file and its sub-caches
    Decode {
        /// Path to the main cache file
        cache: PathBuf,

        #[command(flatten)]
        decode: DecodeArgs,
    },

    /// Decode the shared region of this process
    Live {
        #[command(flatten)]
        decode: DecodeArgs,
    },

    /// Find the installed cache for an architecture and decode it
    Find {
        /// Architecture (e.g., "arm64e", "x86_64")
        #[arg(short, long)]
        arch: String,

        /// Target OS layout to search (default: host OS)
        #[arg(long)]
        os: Option<String>,

        /// Mount prefix to search instead of "/" (repeatable)
        #[arg(long)]
        root: Vec<PathBuf>,

        /// Only print the candidate paths
        #[arg(long)]
        list: bool,

        #[command(flatten)]
        decode: DecodeArgs,
    },

    /// Decode a standalone Mach-O file
    Macho {
        /// Path to the Mach-O file
        file: PathBuf,

        #[command(flatten)]
        decode: DecodeArgs,
    },

    /// Validate a tree previously written as JSON
    Check {
        /// Path to the JSON tree
        tree: PathBuf,
    },
}

#[derive(Args, Debug)]
struct DecodeArgs {
    /// Write the tree as JSON to this path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Tables with more elements are sized but not decoded element-wise
    #[arg(long, default_value_t = DecodeOptions::default().element_threshold)]
    threshold: u64,

    /// Do not lay out the Mach-O images inside the cache
    #[arg(long)]
    no_images: bool,

    /// Do not decode the .symbols file
    #[arg(long)]
    no_symbols: bool,
}

impl DecodeArgs {
    fn options(&self) -> DecodeOptions {
        DecodeOptions {
            element_threshold: self.threshold,
            decode_images: !self.no_images,
            include_symbols_file: !self.no_symbols,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Decode { cache, decode } => cmd_decode(&cache, &decode),
        Commands::Live { decode } => cmd_live(&decode),
        Commands::Find {
            arch,
            os,
            root,
            list,
            decode,
        } => cmd_find(&arch, os.as_deref(), root, list, &decode),
        Commands::Macho { file, decode } => cmd_macho(&file, &decode),
        Commands::Check { tree } => cmd_check(&tree),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn cmd_decode(path: &Path, args: &DecodeArgs) -> Result<()> {
    let mut cache = FileSource::open(path).with_context(|| format!("Failed to open cache: {}", path.display()))?;
    let result = decode_and_report(&cache, args);
    cache.close();
    result
}

fn cmd_live(args: &DecodeArgs) -> Result<()> {
    let mut cache = MemorySource::current_process().context("Failed to open the shared region")?;
    let result = decode_and_report(&cache, args);
    cache.close();
    result
}

fn cmd_find(arch: &str, os: Option<&str>, roots: Vec<PathBuf>, list: bool, args: &DecodeArgs) -> Result<()> {
    let os = match os {
        Some(name) => TargetOs::parse(name)?,
        None => TargetOs::host()?,
    };
    let mut finder = Finder::new(arch, os);
    if !roots.is_empty() {
        finder = finder.with_prefixes(roots);
    }

    if list {
        for candidate in finder.candidates()? {
            println!("{}", candidate.display());
        }
        return Ok(());
    }

    let mut cache = finder
        .find()
        .with_context(|| format!("Failed to find a cache for {}", arch))?;
    info!("Found cache: {}", cache.path().display());
    let result = decode_and_report(&cache, args);
    cache.close();
    result
}

fn cmd_macho(path: &Path, args: &DecodeArgs) -> Result<()> {
    let start = Instant::now();
    let mut file = MachOFile::open(path).with_context(|| format!("Failed to open Mach-O file: {}", path.display()))?;
    let result = decode_macho(&file, &args.options())
        .with_context(|| format!("Failed to decode: {}", path.display()));
    file.close();
    report(&result?, args, start)
}

fn cmd_check(path: &Path) -> Result<()> {
    let tree = load(path).with_context(|| format!("Invalid tree: {}", path.display()))?;
    println!("{}: ok, {}", path.display(), summary(&tree));
    Ok(())
}

fn decode_and_report(cache: &dyn Fetcher, args: &DecodeArgs) -> Result<()> {
    let start = Instant::now();
    let tree = decode_cache(cache, &args.options()).with_context(|| format!("Failed to decode: {}", cache.name()))?;
    report(&tree, args, start)
}

fn report(tree: &Block, args: &DecodeArgs, start: Instant) -> Result<()> {
    println!("{}: {} in {:.2}s", tree.name, summary(tree), start.elapsed().as_secs_f64());
    if let Some(output) = &args.output {
        save(tree, output).with_context(|| format!("Failed to write tree: {}", output.display()))?;
        info!("Wrote {}", output.display());
    }
    Ok(())
}

fn summary(tree: &Block) -> String {
    let stats = tree.stats();
    format!(
        "{} blocks, {} values, {} links, depth {}",
        stats.blocks, stats.values, stats.links, stats.depth
    )
}
