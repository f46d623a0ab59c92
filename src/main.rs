//! Hotchunk CLI
//!
//! Diagnostics for the files a build hands to the runtime.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hotchunk::{ChunkId, HashKind, RuntimeConfig, UpdateManifest, VERSION};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hotchunk")]
#[command(author, version, about = "Module loading and hot-update runtime diagnostics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse an update manifest and print what it changes
    Manifest {
        /// The manifest file (`<runtime>.hot-update.json`)
        file: PathBuf,
    },

    /// Print the URLs the runtime would request for some chunks
    Urls {
        /// Runtime configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Chunk ids
        #[arg(required = true)]
        chunks: Vec<String>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Manifest { file } => show_manifest(&file),
        Commands::Urls { config, chunks } => show_urls(config.as_deref(), &chunks),
        Commands::Version => {
            println!("hotchunk {}", VERSION);
            Ok(())
        }
    }
}

fn setup_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn show_manifest(path: &Path) -> Result<()> {
    let source = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let manifest = UpdateManifest::from_json_str(&source).with_context(|| format!("parsing {}", path.display()))?;
    tracing::debug!(?manifest, "parsed manifest");

    print_list("changed chunks", manifest.changed_chunks.iter().map(ChunkId::as_str));
    print_list("removed chunks", manifest.removed_chunks.iter().map(ChunkId::as_str));
    print_list("removed modules", manifest.removed_modules.iter().map(|id| id.as_str()));
    Ok(())
}

fn print_list<'a>(title: &str, items: impl Iterator<Item = &'a str>) {
    let items: Vec<&str> = items.collect();
    if items.is_empty() {
        println!("{}: none", title);
    } else {
        println!("{}: {}", title, items.join(", "));
    }
}

fn show_urls(config: Option<&Path>, chunks: &[String]) -> Result<()> {
    let config = match config {
        Some(path) => RuntimeConfig::from_path(path)?,
        None => RuntimeConfig::default(),
    };

    println!("manifest: {}", config.hot_update_manifest_url(None));
    for chunk in chunks {
        let id = ChunkId::from(chunk.as_str());
        let js_hash = config.chunk_hashes.js.get(&id).map(String::as_str);
        println!("{}", id);
        println!("  js:         {}{}", config.public_path, config.chunk_path(&id, HashKind::Js, js_hash));
        if let Some(css_hash) = config.chunk_hashes.css.get(&id) {
            println!(
                "  css:        {}{}",
                config.public_path,
                config.chunk_path(&id, HashKind::Css, Some(css_hash.as_str()))
            );
        }
        println!("  hot update: {}", config.hot_update_chunk_url(&id, None));
    }
    Ok(())
}
