use std::{path::PathBuf, sync::Arc};

use common::{RangeFetcher, store::ArchiveStore};
use dump::{
    Archiver, CheckpointStore, Coordinator, CoordinatorReport, Ctx, EndBlock, ObjectStoreArchiver,
    ParquetBatchWriter,
};
use evm_rpc_datasets::JsonRpcClient;
use monitoring::logging::{self, error_with_causes};
use tokio_util::sync::CancellationToken;

mod config;

#[derive(Debug, clap::Parser)]
#[command(version, about = "Extracts blocks, receipts, logs and traces from an EVM node into Parquet files")]
struct Args {
    /// The configuration file to use. Defines the node, the output locations and the extraction
    /// tuning.
    #[arg(long, env = "CHAINDUMP_CONFIG")]
    config: PathBuf,

    /// Stop at this block. Negative values are relative to the latest block. Overrides
    /// `end_block` from the config file.
    #[arg(long, allow_negative_numbers = true)]
    end_block: Option<i64>,
}

#[tokio::main]
async fn main() {
    match main_inner().await {
        Ok(report) if report.all_completed() => {}
        Ok(_) => std::process::exit(1),
        Err(err) => {
            // Manually print the error so we can control the format.
            let err = error_with_causes(&err);
            eprintln!("Exiting with error: {err}");
            std::process::exit(1);
        }
    }
}

async fn main_inner() -> Result<CoordinatorReport, Error> {
    let Args {
        config: config_path,
        end_block,
    } = clap::Parser::parse();

    let config = config::load(config_path)?;

    let _log_guard = match &config.log_dir {
        Some(log_dir) => Some(logging::init_with_file(log_dir)),
        None => {
            logging::init();
            None
        }
    };

    tracing::info!(
        rpc_url = %config.rpc_url,
        data_dir = %config.data_dir.display(),
        archive_url = config.archive_url.as_deref().unwrap_or("-"),
        "version {}",
        env!("CARGO_PKG_VERSION"),
    );

    let fetcher: Arc<dyn RangeFetcher> =
        Arc::new(JsonRpcClient::new(config.rpc_url.clone(), config.request_timeout)?);

    let archiver: Option<Arc<dyn Archiver>> = match &config.archive_url {
        Some(location) => {
            let store = ArchiveStore::new(location, Some(&config.base_dir))?;
            tracing::info!(url = %store.url(), "archiving written files");
            Some(Arc::new(ObjectStoreArchiver::new(store)))
        }
        None => None,
    };

    let end_block = end_block.map(EndBlock::from_signed).unwrap_or(config.end_block);
    let end = end_block
        .resolve(fetcher.as_ref(), config.final_blocks_only)
        .await?;
    tracing::info!(%end_block, end, "resolved target block");

    let ctx = Ctx {
        config: Arc::new(config.extract),
        fetcher,
        writer: Arc::new(ParquetBatchWriter::default()),
        archiver,
        checkpoints: CheckpointStore::new(&config.checkpoint_dir)?,
        data_dir: config.data_dir,
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("received shutdown signal, finishing in-flight flushes");
                cancel.cancel();
            }
        }
    });

    let report = Coordinator::new(ctx, config.streams, cancel).run(end).await;
    for stream in &report.streams {
        println!("{stream}");
    }

    Ok(report)
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("failed to load config")]
    Config(#[from] config::LoadError),

    #[error("failed to create RPC client")]
    Provider(#[from] evm_rpc_datasets::ProviderError),

    #[error("failed to open archive location")]
    Archive(#[from] common::store::StoreError),

    #[error("failed to resolve end block")]
    EndBlock(#[from] dump::ResolutionError),

    #[error("failed to open checkpoint directory")]
    Checkpoints(#[from] dump::CheckpointError),
}
