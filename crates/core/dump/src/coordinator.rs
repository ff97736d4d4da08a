use std::collections::HashMap;

use common::{BlockNum, StreamKind};
use monitoring::logging;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::extractor::{Ctx, StreamError, StreamExtractor, StreamOutcome};

/// Runs one [`StreamExtractor`] per configured stream and waits for all of them.
///
/// Unlike a fail-fast task group, a stream that fails or panics does not abort its siblings. It
/// is reported, and the other streams keep running to the target.
pub struct Coordinator {
    ctx: Ctx,
    streams: Vec<StreamKind>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        ctx: Ctx,
        streams: impl IntoIterator<Item = StreamKind>,
        cancel: CancellationToken,
    ) -> Self {
        let mut streams: Vec<_> = streams.into_iter().collect();
        streams.sort();
        streams.dedup();
        Self {
            ctx,
            streams,
            cancel,
        }
    }

    /// Runs every stream up to `end` and reports where each one stopped.
    pub async fn run(self, end: BlockNum) -> CoordinatorReport {
        tracing::info!(end, streams = ?self.streams, "starting extraction");

        let mut tasks = JoinSet::new();
        let mut kinds = HashMap::new();
        for kind in self.streams.iter().copied() {
            let mut extractor = StreamExtractor::new(kind, self.ctx.clone(), self.cancel.clone());
            let span = tracing::info_span!("stream_task", stream = %kind);
            let handle = tasks.spawn(
                async move {
                    let result = extractor.run(end).await;
                    StreamReport::new(kind, extractor.checkpoint(), result)
                }
                .instrument(span),
            );
            kinds.insert(handle.id(), kind);
        }

        let mut reports = Vec::with_capacity(self.streams.len());
        while let Some(joined) = tasks.join_next().await {
            let report = match joined {
                Ok(report) => report,
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        error_source = logging::error_source(&err),
                        "stream task {} panicked",
                        err.id()
                    );
                    let Some(kind) = kinds.get(&err.id()).copied() else {
                        continue;
                    };
                    // The last save that went through is still the resume point.
                    let checkpoint = self.ctx.checkpoints.load(kind).await.unwrap_or_default();
                    StreamReport::new(kind, checkpoint, Err(StreamError::Panicked(err.to_string())))
                }
            };
            report.log();
            reports.push(report);
        }

        reports.sort_by_key(|report| report.kind);
        CoordinatorReport { streams: reports }
    }
}

/// Where each stream stopped, in stream order.
#[derive(Debug)]
pub struct CoordinatorReport {
    pub streams: Vec<StreamReport>,
}

impl CoordinatorReport {
    /// Whether every stream reached the target.
    pub fn all_completed(&self) -> bool {
        self.streams
            .iter()
            .all(|report| matches!(report.status, StreamStatus::Completed))
    }

    pub fn get(&self, kind: StreamKind) -> Option<&StreamReport> {
        self.streams.iter().find(|report| report.kind == kind)
    }
}

#[derive(Debug)]
pub struct StreamReport {
    pub kind: StreamKind,
    /// Last durably committed block.
    pub checkpoint: BlockNum,
    pub status: StreamStatus,
}

impl StreamReport {
    fn new(kind: StreamKind, checkpoint: BlockNum, result: Result<StreamOutcome, StreamError>) -> Self {
        let status = match result {
            Ok(StreamOutcome::Completed) => StreamStatus::Completed,
            Ok(StreamOutcome::Cancelled) => StreamStatus::Cancelled,
            Err(err) => StreamStatus::Failed(err),
        };
        Self {
            kind,
            checkpoint,
            status,
        }
    }

    fn log(&self) {
        match &self.status {
            StreamStatus::Failed(err) => tracing::error!(
                stream = %self.kind,
                checkpoint = self.checkpoint,
                error = %err,
                error_source = logging::error_source(err),
                "stream stopped"
            ),
            status => tracing::info!(
                stream = %self.kind,
                checkpoint = self.checkpoint,
                %status,
                "stream finished"
            ),
        }
    }
}

impl std::fmt::Display for StreamReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: checkpoint {}, {}",
            self.kind, self.checkpoint, self.status
        )
    }
}

#[derive(Debug)]
pub enum StreamStatus {
    Completed,
    /// Stopped by a fatal error or after exhausting retries.
    Failed(StreamError),
    Cancelled,
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamStatus::Completed => f.write_str("completed"),
            StreamStatus::Failed(err) => write!(f, "failed: {}", logging::error_with_causes(err)),
            StreamStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}
