use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hexpatch::{
    apply_patch, apply_tree_patch, create_tree_patch, generate_patch, patch_format, ApplyConfig,
    CancelFlag, Compression, DeltaConfig, TreeDiffConfig,
};

#[derive(Parser)]
#[command(name = "hexpatch", about = "Binary patch creator and applier", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch from two versions of a file
    Diff {
        /// Original file
        old: PathBuf,
        /// Updated file
        new: PathBuf,
        /// Output path for the patch
        #[arg(long, short)]
        output: PathBuf,
        /// Delta block size in bytes
        #[arg(long, default_value_t = 4096)]
        block_size: usize,
        /// Literal data codec: none, gzip, lz4, zstd
        #[arg(long, default_value = "gzip")]
        compression: String,
    },
    /// Apply a patch to a source file
    Apply {
        /// Source file the patch was made against
        source: PathBuf,
        /// Patch file
        patch: PathBuf,
        /// Output path for the reconstructed file
        #[arg(long, short)]
        output: PathBuf,
        /// Skip post-apply digest verification
        #[arg(long)]
        no_verify: bool,
        /// Back up an existing output before replacing it
        #[arg(long)]
        backup: bool,
    },
    /// Create a tree patch from two directory versions
    DiffDir {
        /// Old directory
        old: PathBuf,
        /// New directory
        new: PathBuf,
        /// Output path for the tree patch
        #[arg(long, short)]
        output: PathBuf,
        /// Skip entries whose basename starts with "."
        #[arg(long)]
        ignore_hidden: bool,
        /// Comma-separated ignore patterns (replaces the default set)
        #[arg(long)]
        ignore: Option<String>,
        /// Worker threads for per-file deltas
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Literal data codec: none, gzip, lz4, zstd
        #[arg(long, default_value = "gzip")]
        compression: String,
    },
    /// Apply a tree patch to a directory in place
    ApplyDir {
        /// Target directory to patch
        target: PathBuf,
        /// Tree patch file
        patch: PathBuf,
        /// Skip per-file digest verification
        #[arg(long)]
        no_verify: bool,
    },
    /// Show the header of a patch file
    Info {
        /// Patch file
        patch: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Diff {
            old,
            new,
            output,
            block_size,
            compression,
        } => {
            let config = DeltaConfig {
                block_size,
                ..DeltaConfig::default()
            };
            let compression: Compression = compression.parse()?;

            let start = Instant::now();
            generate_patch(&old, &new, &output, &config, compression)?;
            let patch_size = std::fs::metadata(&output)?.len();

            println!("Patch created: {}", output.display());
            println!("  Patch size: {patch_size} bytes");
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Apply {
            source,
            patch,
            output,
            no_verify,
            backup,
        } => {
            let config = ApplyConfig {
                verify: !no_verify,
                backup,
                ..ApplyConfig::default()
            };

            let start = Instant::now();
            let report = apply_patch(&source, &patch, &output, &config)?;

            println!("Patch applied: {}", output.display());
            println!("  Operations applied: {}", report.operations_applied);
            println!("  Bytes written: {}", report.bytes_written);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::DiffDir {
            old,
            new,
            output,
            ignore_hidden,
            ignore,
            workers,
            compression,
        } => {
            let mut config = TreeDiffConfig {
                ignore_hidden,
                worker_count: workers,
                compression: compression.parse()?,
                ..TreeDiffConfig::default()
            };
            if let Some(patterns) = ignore {
                config.ignore_patterns = patterns
                    .split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect();
            }

            let start = Instant::now();
            let summary =
                create_tree_patch(&old, &new, &output, &config, &CancelFlag::new()).await?;

            println!("Tree patch created: {}", output.display());
            println!("  Files added: {}", summary.added);
            println!("  Files modified: {}", summary.modified);
            println!("  Files deleted: {}", summary.deleted);
            println!("  Files unchanged: {}", summary.unchanged);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::ApplyDir {
            target,
            patch,
            no_verify,
        } => {
            let config = ApplyConfig {
                verify: !no_verify,
                ..ApplyConfig::default()
            };

            let start = Instant::now();
            let summary = apply_tree_patch(&patch, &target, &config).await?;

            println!("Tree patch applied to {}", target.display());
            println!("  Files added: {}", summary.added);
            println!("  Files modified: {}", summary.modified);
            println!("  Files deleted: {}", summary.deleted);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Info { patch } => {
            let header = patch_format::read_header(&patch)?;
            let patch_size = std::fs::metadata(&patch)?.len();

            println!("Patch: {}", patch.display());
            println!("  Size: {patch_size} bytes");
            println!("  Created: {} (unix)", header.timestamp);
            println!("  Compression: {}", header.compression.name());
            println!("  Source size: {} bytes", header.source_size);
            println!("  Target size: {} bytes", header.target_size);
            println!("  Operations: {}", header.operation_count);
            println!("  Source digest: {}", hex_prefix(&header.source_checksum));
            println!("  Target digest: {}", hex_prefix(&header.target_checksum));
        }
    }

    Ok(())
}

/// First 8 bytes of a digest as hex, or "unchecked" for the zero sentinel.
fn hex_prefix(digest: &[u8; 32]) -> String {
    if digest.iter().all(|&b| b == 0) {
        return "unchecked".to_string();
    }
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
