//! # Stream extraction loop
//!
//! A [`StreamExtractor`] drives one stream from its last durable checkpoint to a target block:
//!
//! 1. **Fetch**: per-block streams (blocks, receipts) fetch a round of consecutive blocks
//!    concurrently, bounded by the stream's [`Dispatcher`], and consume the results in block
//!    order. Ranged streams (logs, traces) issue one ranged query at a time, sized by the
//!    stream's [`AdaptiveWindow`]. No fetch reaches past the block at which the current batch
//!    hits the flush threshold, so batch boundaries fall on multiples of the threshold counted
//!    from the resume point.
//!
//! 2. **Recover**: an overflow on a ranged query halves the window and retries the same start
//!    block after a short pause. Once the window is at its minimum, an overflow counts as a
//!    transient failure. Transient failures are retried after an exponential backoff; the stream
//!    stops after `retry.max_attempts` consecutive failures. Fatal errors stop it immediately.
//!
//! 3. **Flush**: once the batch covers `flush_threshold` blocks, or the target is reached, the
//!    batch is written to its partition path, uploaded when archival is configured, and only
//!    then is the checkpoint advanced to the last block of the batch. Failing any of these steps
//!    puts the batch back and retries the whole flush after a backoff. Batches without records
//!    are never flushed.
//!
//! Cancellation abandons in-flight fetches and backoff pauses. A flush that already started
//! always runs to completion, so no checkpoint is ever left half saved.

use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use common::{BlockNum, BoxError, FetchError, FetchErrorKind, RangeFetcher, RawRecord, StreamKind};
use futures::{StreamExt as _, stream};
use monitoring::logging;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    accumulator::{Batch, BatchAccumulator},
    archive::{ArchiveError, Archiver},
    checkpoint::{CheckpointError, CheckpointStore},
    config::Config,
    dispatcher::Dispatcher,
    partition::PartitionKey,
    retry::Backoff,
    window::AdaptiveWindow,
    writer::{BatchWriter, WriteError},
};

/// Collaborators shared by all streams of one run.
#[derive(Clone)]
pub struct Ctx {
    pub config: Arc<Config>,
    pub fetcher: Arc<dyn RangeFetcher>,
    pub writer: Arc<dyn BatchWriter>,
    /// When unset, archival is decoupled and a checkpoint advances once the file is written.
    pub archiver: Option<Arc<dyn Archiver>>,
    pub checkpoints: CheckpointStore,
    /// Local root under which partition files are written.
    pub data_dir: PathBuf,
}

/// How a stream that did not fail stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Every block up to the target was processed.
    Completed,
    /// Shutdown was requested before the target was reached.
    Cancelled,
}

/// Extracts one stream. See the [module docs](self).
pub struct StreamExtractor {
    kind: StreamKind,
    ctx: Ctx,
    dispatcher: Dispatcher,
    window: AdaptiveWindow,
    accumulator: BatchAccumulator,
    backoff: Backoff,
    cancel: CancellationToken,
    checkpoint: BlockNum,
}

impl StreamExtractor {
    pub fn new(kind: StreamKind, ctx: Ctx, cancel: CancellationToken) -> Self {
        let config = &ctx.config;
        Self {
            kind,
            dispatcher: Dispatcher::new(config.concurrent_request_limit),
            window: AdaptiveWindow::new(config.window_size, config.min_window_size),
            accumulator: BatchAccumulator::new(kind, config.flush_threshold),
            backoff: Backoff::new(&config.retry),
            cancel,
            checkpoint: 0,
            ctx,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// The last durably committed block.
    pub fn checkpoint(&self) -> BlockNum {
        self.checkpoint
    }

    /// Current size of the ranged query window.
    pub fn window_size(&self) -> u64 {
        self.window.size()
    }

    /// Runs the stream until every block up to `end` is committed, the stream fails, or shutdown
    /// is requested.
    #[instrument(skip(self), fields(stream = %self.kind), err)]
    pub async fn run(&mut self, end: BlockNum) -> Result<StreamOutcome, StreamError> {
        self.checkpoint = self
            .ctx
            .checkpoints
            .load(self.kind)
            .await
            .map_err(StreamError::LoadCheckpoint)?;

        let mut cursor = self.checkpoint + 1;
        if cursor > end {
            info!(checkpoint = self.checkpoint, end, "stream already at target");
            return Ok(StreamOutcome::Completed);
        }
        info!(from = cursor, to = end, "starting stream");

        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.cancelled());
            }

            let limit = self.accumulator.flush_limit(cursor).min(end);
            let cancel = self.cancel.clone();
            let round = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(self.cancelled()),
                round = self.fetch_round(cursor, limit) => round,
            };

            if let Some(to) = round.fetched_to {
                debug!(from = cursor, to, records = round.records.len(), "fetched");
                self.accumulator.append(cursor, to, round.records);
                self.backoff.reset();
                cursor = to + 1;
            }

            if let Some(err) = round.error
                && self.recover(cursor, limit, err).await? == Recovery::Cancelled
            {
                return Ok(self.cancelled());
            }

            let is_final = cursor > end;
            if self.accumulator.should_flush(is_final)
                && self.flush().await? == Recovery::Cancelled
            {
                return Ok(self.cancelled());
            }

            if is_final {
                info!(checkpoint = self.checkpoint, "stream reached target");
                return Ok(StreamOutcome::Completed);
            }
        }
    }

    /// Fetches the next records starting at `from`, never past `limit`.
    async fn fetch_round(&self, from: BlockNum, limit: BlockNum) -> FetchRound {
        if self.kind.is_ranged() {
            self.fetch_ranged(from, limit).await
        } else {
            self.fetch_per_block(from, limit).await
        }
    }

    async fn fetch_ranged(&self, from: BlockNum, limit: BlockNum) -> FetchRound {
        let (from, to) = self.window.range(from, limit);
        let result = async {
            let _permit = self.dispatcher.acquire().await.map_err(FetchError::fatal)?;
            match self.kind {
                StreamKind::Logs => self.ctx.fetcher.fetch_logs(from, to).await,
                _ => self.ctx.fetcher.fetch_traces(from, to).await,
            }
        }
        .await;

        match result {
            Ok(mut records) => {
                records.sort_by_key(RawRecord::block_num);
                FetchRound {
                    fetched_to: Some(to),
                    records,
                    error: None,
                }
            }
            Err(err) => FetchRound::failed(err),
        }
    }

    /// Fetches up to `window_size` blocks concurrently. On the first failure, the blocks before
    /// the failed one are kept and the rest of the round is dropped.
    async fn fetch_per_block(&self, from: BlockNum, limit: BlockNum) -> FetchRound {
        let to = from
            .saturating_add(self.ctx.config.window_size.max(1) - 1)
            .min(limit);
        let kind = self.kind;
        let fetcher = &self.ctx.fetcher;
        let dispatcher = &self.dispatcher;

        let mut results = std::pin::pin!(stream::iter(from..=to)
            .map(|block_num| async move {
                let _permit = dispatcher.acquire().await.map_err(FetchError::fatal)?;
                let records = match kind {
                    StreamKind::Blocks => vec![fetcher.fetch_block(block_num).await?],
                    _ => fetcher.fetch_receipts(block_num).await?,
                };
                Ok::<_, FetchError>((block_num, records))
            })
            .buffered(dispatcher.max_concurrent()));

        let mut round = FetchRound::default();
        while let Some(result) = results.next().await {
            match result {
                Ok((block_num, records)) => {
                    round.fetched_to = Some(block_num);
                    round.records.extend(records);
                }
                Err(err) => {
                    round.error = Some(err);
                    break;
                }
            }
        }
        round
    }

    /// Reacts to a failed fetch at `cursor` of a round bounded by `limit`. Returns an error if the
    /// stream must stop.
    async fn recover(
        &mut self,
        cursor: BlockNum,
        limit: BlockNum,
        err: FetchError,
    ) -> Result<Recovery, StreamError> {
        match err.kind {
            FetchErrorKind::Fatal => {
                return Err(StreamError::Fatal {
                    block: cursor,
                    source: err,
                });
            }
            FetchErrorKind::Overflow if self.kind.is_ranged() => {
                let (from, to) = self.window.range(cursor, limit);
                let requested = to - from + 1;
                if self.window.shrink(requested) {
                    warn!(
                        from,
                        to,
                        window = self.window.size(),
                        error = %err,
                        error_source = logging::error_source(&err),
                        "result set too large, shrinking window"
                    );
                    return Ok(self.pause(self.ctx.config.overflow_pause()).await);
                }
                warn!(
                    from = cursor,
                    window = self.window.size(),
                    "result set too large at minimum window"
                );
            }
            _ => {}
        }
        self.retry_after_failure(cursor, err.into()).await
    }

    /// Writes, archives and commits the current batch, retrying the whole sequence until it
    /// succeeds, the attempts are exhausted or shutdown is requested during a backoff pause.
    async fn flush(&mut self) -> Result<Recovery, StreamError> {
        while let Some(batch) = self.accumulator.take_and_reset() {
            let batch = Arc::new(batch);
            match self.commit(batch.clone()).await {
                Ok(Some(last_block)) => {
                    self.checkpoint = last_block;
                    self.backoff.reset();
                    return Ok(Recovery::Retry);
                }
                Ok(None) => {
                    // Nothing persisted. Keep covering the range with the next records.
                    self.accumulator.restore(Batch {
                        records: Vec::new(),
                        ..unwrap_batch(batch)
                    });
                    return Ok(Recovery::Retry);
                }
                Err(err) => {
                    let first_block = batch.first_block;
                    self.accumulator.restore(unwrap_batch(batch));
                    if self.retry_after_failure(first_block, err.into()).await? == Recovery::Cancelled {
                        return Ok(Recovery::Cancelled);
                    }
                }
            }
        }
        Ok(Recovery::Retry)
    }

    /// Persists `batch` and advances the checkpoint past it. Returns the new checkpoint, or
    /// `None` if the writer had nothing to persist.
    async fn commit(&self, batch: Arc<Batch>) -> Result<Option<BlockNum>, FlushError> {
        let key = PartitionKey::new(self.kind, batch.first_block, batch.last_block, Utc::now());
        let path = self.ctx.data_dir.join(key.path());

        let Some(written) = self.ctx.writer.write(batch.clone(), &path).await? else {
            return Ok(None);
        };
        if let Some(archiver) = &self.ctx.archiver {
            let uri = archiver.upload(&written, &key.path()).await?;
            debug!(%uri, "archived batch");
        }
        self.ctx.checkpoints.save(self.kind, batch.last_block).await?;

        info!(
            first_block = batch.first_block,
            last_block = batch.last_block,
            records = batch.records.len(),
            partition = %key,
            "committed batch"
        );
        Ok(Some(batch.last_block))
    }

    /// Records a transient failure and waits out the backoff delay.
    async fn retry_after_failure(
        &mut self,
        block: BlockNum,
        err: BoxError,
    ) -> Result<Recovery, StreamError> {
        let Some(delay) = self.backoff.next_delay() else {
            return Err(StreamError::RetriesExhausted {
                block,
                attempts: self.backoff.failures(),
                source: err,
            });
        };

        // Escalate the level as consecutive failures pile up.
        let attempt = self.backoff.failures();
        if attempt >= 3 {
            warn!(
                block,
                attempt,
                ?delay,
                error = %err,
                error_source = logging::error_source(&*err),
                "repeated failures, retrying"
            );
        } else {
            debug!(
                block,
                attempt,
                ?delay,
                error = %err,
                error_source = logging::error_source(&*err),
                "transient failure, retrying"
            );
        }
        Ok(self.pause(delay).await)
    }

    async fn pause(&self, delay: Duration) -> Recovery {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Recovery::Cancelled,
            _ = tokio::time::sleep(delay) => Recovery::Retry,
        }
    }

    fn cancelled(&self) -> StreamOutcome {
        info!(checkpoint = self.checkpoint, "stream cancelled");
        StreamOutcome::Cancelled
    }
}

fn unwrap_batch(batch: Arc<Batch>) -> Batch {
    Arc::try_unwrap(batch).unwrap_or_else(|shared| (*shared).clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Retry,
    Cancelled,
}

/// Outcome of one fetch round. A round can make progress and still end with an error.
#[derive(Debug, Default)]
struct FetchRound {
    /// Last block covered by `records`, if the round made progress.
    fetched_to: Option<BlockNum>,
    records: Vec<RawRecord>,
    error: Option<FetchError>,
}

impl FetchRound {
    fn failed(err: FetchError) -> Self {
        Self {
            error: Some(err),
            ..Default::default()
        }
    }
}

/// A failed step of a flush. The whole flush is retried.
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("failed to write batch")]
    Write(#[from] WriteError),

    #[error("failed to archive batch")]
    Archive(#[from] ArchiveError),

    #[error("failed to save checkpoint")]
    Checkpoint(#[from] CheckpointError),
}

/// Why a stream stopped before reaching its target.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The checkpoint could not be read, so the resume point is unknown.
    #[error("failed to load checkpoint")]
    LoadCheckpoint(#[source] CheckpointError),

    /// The node rejected a request in a way retrying cannot fix.
    #[error("fatal error at block {block}")]
    Fatal {
        block: BlockNum,
        #[source]
        source: FetchError,
    },

    /// Fetching or flushing kept failing.
    #[error("gave up at block {block} after {attempts} consecutive failures")]
    RetriesExhausted {
        block: BlockNum,
        attempts: usize,
        #[source]
        source: BoxError,
    },

    /// The stream task panicked.
    #[error("stream task panicked: {0}")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::writer::ParquetBatchWriter;

    /// Logs fetcher that fails with an overflow for ranges wider than `max_span` blocks.
    struct LimitedLogs {
        max_span: u64,
        requests: Mutex<Vec<(BlockNum, BlockNum)>>,
    }

    #[async_trait]
    impl RangeFetcher for LimitedLogs {
        async fn fetch_block(&self, _: BlockNum) -> Result<RawRecord, FetchError> {
            unimplemented!()
        }

        async fn fetch_receipts(&self, _: BlockNum) -> Result<Vec<RawRecord>, FetchError> {
            unimplemented!()
        }

        async fn fetch_logs(&self, from: BlockNum, to: BlockNum) -> Result<Vec<RawRecord>, FetchError> {
            self.requests.lock().unwrap().push((from, to));
            if to - from + 1 > self.max_span {
                return Err(FetchError::overflow("query returned more than 10000 results"));
            }
            Ok((from..=to)
                .map(|n| {
                    RawRecord::from_json(StreamKind::Logs, json!({ "blockNumber": format!("{n:#x}") }))
                        .unwrap()
                })
                .collect())
        }

        async fn fetch_traces(&self, _: BlockNum, _: BlockNum) -> Result<Vec<RawRecord>, FetchError> {
            unimplemented!()
        }

        async fn latest_block(&self, _: bool) -> Result<BlockNum, FetchError> {
            Ok(1_000)
        }
    }

    fn ctx(dir: &std::path::Path, fetcher: Arc<dyn RangeFetcher>, config: Config) -> Ctx {
        Ctx {
            config: Arc::new(config),
            fetcher,
            writer: Arc::new(ParquetBatchWriter::default()),
            archiver: None,
            checkpoints: CheckpointStore::new(dir.join("checkpoints")).unwrap(),
            data_dir: dir.join("data"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_shrinks_window_until_requests_fit() {
        //* Given
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(LimitedLogs {
            max_span: 30,
            requests: Default::default(),
        });
        let config = Config {
            window_size: 100,
            min_window_size: 10,
            flush_threshold: 1_000,
            ..Default::default()
        };
        let mut extractor = StreamExtractor::new(
            StreamKind::Logs,
            ctx(dir.path(), fetcher.clone(), config),
            CancellationToken::new(),
        );

        //* When
        let outcome = extractor.run(100).await.expect("run should succeed");

        //* Then
        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(extractor.window_size(), 25);
        assert_eq!(extractor.checkpoint(), 100);
        let requests = fetcher.requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            [(1, 100), (1, 50), (1, 25), (26, 50), (51, 75), (76, 100)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_of_query_clamped_to_flush_boundary_retries_a_smaller_range() {
        //* Given
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(LimitedLogs {
            max_span: 20,
            requests: Default::default(),
        });
        let config = Config {
            window_size: 100,
            min_window_size: 10,
            flush_threshold: 30,
            ..Default::default()
        };
        let mut extractor = StreamExtractor::new(
            StreamKind::Logs,
            ctx(dir.path(), fetcher.clone(), config),
            CancellationToken::new(),
        );

        //* When
        let outcome = extractor.run(30).await.expect("run should succeed");

        //* Then
        assert_eq!(outcome, StreamOutcome::Completed);
        let requests = fetcher.requests.lock().unwrap().clone();
        assert_eq!(requests, [(1, 30), (1, 15), (16, 30)]);
        assert_eq!(extractor.window_size(), 15);
        assert_eq!(extractor.checkpoint(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_at_minimum_window_exhausts_retries() {
        //* Given
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(LimitedLogs {
            max_span: 5,
            requests: Default::default(),
        });
        let mut config = Config {
            window_size: 20,
            min_window_size: 10,
            ..Default::default()
        };
        config.retry.max_attempts = 3;
        let mut extractor = StreamExtractor::new(
            StreamKind::Logs,
            ctx(dir.path(), fetcher.clone(), config),
            CancellationToken::new(),
        );

        //* When
        let result = extractor.run(100).await;

        //* Then
        assert!(matches!(
            result,
            Err(StreamError::RetriesExhausted {
                block: 1,
                attempts: 3,
                ..
            })
        ));
        assert_eq!(extractor.window_size(), 10);
        // One overflow at 20 shrinks the window, then three attempts at the minimum.
        assert_eq!(fetcher.requests.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn cancelled_before_start_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(LimitedLogs {
            max_span: 100,
            requests: Default::default(),
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut extractor = StreamExtractor::new(
            StreamKind::Logs,
            ctx(dir.path(), fetcher.clone(), Config::default()),
            cancel,
        );

        let outcome = extractor.run(100).await.unwrap();

        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert_eq!(extractor.checkpoint(), 0);
        assert!(fetcher.requests.lock().unwrap().is_empty());
    }
}
