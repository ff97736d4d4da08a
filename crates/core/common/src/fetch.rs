//! The seam between the extraction pipeline and a node.

use async_trait::async_trait;

use crate::{BlockNum, BoxError, RawRecord};

/// Fetches raw records from a node.
///
/// Per-block streams (blocks, receipts) are queried one block at a time. Ranged streams (logs,
/// traces) are queried over an inclusive block range, and may fail with an
/// [`FetchErrorKind::Overflow`] error when the node refuses to return that many results.
#[async_trait]
pub trait RangeFetcher: Send + Sync + 'static {
    async fn fetch_block(&self, block_num: BlockNum) -> Result<RawRecord, FetchError>;

    async fn fetch_receipts(&self, block_num: BlockNum) -> Result<Vec<RawRecord>, FetchError>;

    async fn fetch_logs(&self, from: BlockNum, to: BlockNum)
    -> Result<Vec<RawRecord>, FetchError>;

    async fn fetch_traces(
        &self,
        from: BlockNum,
        to: BlockNum,
    ) -> Result<Vec<RawRecord>, FetchError>;

    /// The current chain head, or the latest finalized block when `finalized` is set.
    async fn latest_block(&self, finalized: bool) -> Result<BlockNum, FetchError>;
}

/// How the extraction loop should react to a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// The requested range's result set exceeds the node's limit. Retry with a smaller range.
    Overflow,
    /// Timeouts, dropped connections, an unavailable node. Retry the same request after a delay.
    Transient,
    /// Malformed requests, authentication failures. Retrying will not help.
    Fatal,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchErrorKind::Overflow => "overflow",
            FetchErrorKind::Transient => "transient",
            FetchErrorKind::Fatal => "fatal",
        }
        .fmt(f)
    }
}

/// A classified fetch failure.
#[derive(Debug, thiserror::Error)]
#[error("{kind} fetch error")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    #[source]
    pub source: BoxError,
}

impl FetchError {
    pub fn overflow(source: impl Into<BoxError>) -> Self {
        Self {
            kind: FetchErrorKind::Overflow,
            source: source.into(),
        }
    }

    pub fn transient(source: impl Into<BoxError>) -> Self {
        Self {
            kind: FetchErrorKind::Transient,
            source: source.into(),
        }
    }

    pub fn fatal(source: impl Into<BoxError>) -> Self {
        Self {
            kind: FetchErrorKind::Fatal,
            source: source.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == FetchErrorKind::Fatal
    }
}
