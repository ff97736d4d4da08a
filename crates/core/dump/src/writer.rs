//! Persisting flushed batches as Parquet files.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    error::ArrowError,
    json::{ReaderBuilder, reader::infer_json_schema_from_iterator},
};
use async_trait::async_trait;
use common::RawRecord;
use fs_err as fs;
use parquet::{
    arrow::ArrowWriter,
    basic::Compression,
    errors::ParquetError,
    file::properties::WriterProperties,
    format::KeyValue,
};
use tokio::task::JoinError;
use tracing::debug;

use crate::accumulator::Batch;

/// Key of the Parquet footer entry holding the block range of the file, as `first-last`.
pub const BLOCK_RANGE_METADATA_KEY: &str = "chaindump.block_range";

/// Number of JSON rows decoded into one Arrow record batch.
const DECODE_BATCH_SIZE: usize = 8_192;

/// Persists a batch at a local path.
#[async_trait]
pub trait BatchWriter: Send + Sync + 'static {
    /// Writes `batch` to `path`, creating parent directories as needed.
    ///
    /// Returns `None` without touching the filesystem if the batch holds no records.
    async fn write(&self, batch: Arc<Batch>, path: &Path) -> Result<Option<PathBuf>, WriteError>;
}

/// Writes each batch as one Snappy-compressed Parquet file.
///
/// The schema is inferred from the records of the batch, so nested node objects end up as
/// struct and list columns. The file is written next to its destination under a temporary name
/// and renamed into place once complete, so an interrupted write never leaves a partial file at
/// the destination.
#[derive(Debug, Clone)]
pub struct ParquetBatchWriter {
    props: WriterProperties,
}

impl Default for ParquetBatchWriter {
    fn default() -> Self {
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_dictionary_enabled(true)
            .build();
        Self { props }
    }
}

#[async_trait]
impl BatchWriter for ParquetBatchWriter {
    async fn write(&self, batch: Arc<Batch>, path: &Path) -> Result<Option<PathBuf>, WriteError> {
        if batch.is_empty() {
            return Ok(None);
        }
        let props = self.props.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || write_parquet(&batch, &path, props).map(Some)).await?
    }
}

fn write_parquet(batch: &Batch, path: &Path, props: WriterProperties) -> Result<PathBuf, WriteError> {
    let parent = path
        .parent()
        .ok_or_else(|| WriteError::InvalidPath(path.to_path_buf()))?;
    fs::create_dir_all(parent)?;

    let rows: Vec<&serde_json::Value> = batch.records.iter().map(RawRecord::value).collect();
    let schema = Arc::new(infer_json_schema_from_iterator(
        rows.iter().map(|row| Ok::<_, ArrowError>(*row)),
    )?);
    let mut decoder = ReaderBuilder::new(schema.clone())
        .with_batch_size(DECODE_BATCH_SIZE)
        .build_decoder()?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".parquet.tmp")
        .tempfile_in(parent)?;
    let mut writer = ArrowWriter::try_new(&mut tmp, schema, Some(props))?;
    for chunk in rows.chunks(DECODE_BATCH_SIZE) {
        decoder.serialize(chunk)?;
        if let Some(record_batch) = decoder.flush()? {
            writer.write(&record_batch)?;
        }
    }
    writer.append_key_value_metadata(KeyValue::new(
        BLOCK_RANGE_METADATA_KEY.to_string(),
        format!("{}-{}", batch.first_block, batch.last_block),
    ));
    let meta = writer.close()?;

    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;

    debug!(
        path = %path.display(),
        rows = meta.num_rows,
        first_block = batch.first_block,
        last_block = batch.last_block,
        "wrote parquet file"
    );
    Ok(path.to_path_buf())
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The records could not be converted to Arrow, e.g. a field holds an object in one record
    /// and a scalar in another.
    #[error("failed to convert records to arrow")]
    Arrow(#[from] ArrowError),

    #[error("failed to encode parquet")]
    Parquet(#[from] ParquetError),

    #[error("failed to write output file")]
    Io(#[from] std::io::Error),

    #[error("output path has no parent directory: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("writer task failed")]
    Join(#[from] JoinError),
}
