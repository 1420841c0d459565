use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use glacier_upload::chunker::hash_archive;
use glacier_upload::{MemoryVault, PartSize, UploadConfig, Uploader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Tree-hash and upload archives in parts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prints the archive tree hash of a file.
    Hash {
        file: PathBuf,
        #[arg(long, default_value_t = PartSize::MIN)]
        part_size: PartSize,
    },
    /// Uploads a file into an in-process vault and prints the receipt.
    Upload {
        file: PathBuf,
        #[arg(long)]
        vault: String,
        #[arg(long, default_value_t = PartSize::MIN)]
        part_size: PartSize,
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
        #[arg(long)]
        max_attempts: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Hash { file, part_size } => {
            let reader = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("failed to open {}", file.display()))?;
            let (tree_hash, len) = hash_archive(part_size, reader).await?;
            println!("{tree_hash}  {len}  {}", file.display());
        }
        Command::Upload {
            file,
            vault,
            part_size,
            concurrency,
            max_attempts,
        } => {
            let mut config = UploadConfig::builder()
                .part_size(part_size)
                .concurrency(concurrency);
            if let Some(max_attempts) = max_attempts {
                config = config.max_attempts(max_attempts);
            }
            let config = config.build()?;

            let backend = Arc::new(MemoryVault::new());
            let uploader = Uploader::new(backend, config);

            let cancel = uploader.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, cancelling upload");
                    cancel.cancel();
                }
            });

            let receipt = uploader.upload_file(&file, &vault).await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
    }

    Ok(())
}
