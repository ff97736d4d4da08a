//! # Dump
//!
//! The per-stream extraction pipeline: fetch records from a node, accumulate them into batches,
//! persist each batch as a Parquet partition, archive it, and only then advance the stream's
//! durable checkpoint. See [`extractor`] for the loop itself and [`coordinator`] for running the
//! four streams side by side.

pub mod accumulator;
pub mod archive;
pub mod block_ranges;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod extractor;
pub mod partition;
pub mod retry;
pub mod window;
pub mod writer;

pub use self::{
    accumulator::{Batch, BatchAccumulator},
    archive::{ArchiveError, Archiver, ObjectStoreArchiver},
    block_ranges::{EndBlock, ResolutionError},
    checkpoint::{CheckpointError, CheckpointStore},
    config::{Config, InvalidConfigError, RetryConfig},
    coordinator::{Coordinator, CoordinatorReport, StreamReport, StreamStatus},
    extractor::{Ctx, FlushError, StreamError, StreamExtractor, StreamOutcome},
    partition::PartitionKey,
    writer::{BatchWriter, ParquetBatchWriter, WriteError},
};
