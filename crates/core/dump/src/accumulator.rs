//! In-memory buffering of fetched records until a flush.

use common::{BlockNum, RawRecord, StreamKind};

/// Records of one stream covering the contiguous block range `[first_block, last_block]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub kind: StreamKind,
    pub first_block: BlockNum,
    pub last_block: BlockNum,
    pub records: Vec<RawRecord>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of blocks covered, including blocks that produced no records.
    pub fn span(&self) -> u64 {
        self.last_block - self.first_block + 1
    }
}

/// Buffers fetched records of one stream until the covered span reaches the flush threshold.
///
/// The accumulator tracks the covered block range separately from the records, since a range may
/// legitimately produce none (blocks without logs). A span that reaches the threshold with no
/// records is not flushed; it keeps growing until records arrive or the stream ends, so the
/// ranges of flushed batches stay contiguous.
#[derive(Debug)]
pub struct BatchAccumulator {
    kind: StreamKind,
    flush_threshold: u64,
    covered: Option<(BlockNum, BlockNum)>,
    records: Vec<RawRecord>,
}

impl BatchAccumulator {
    pub fn new(kind: StreamKind, flush_threshold: u64) -> Self {
        Self {
            kind,
            flush_threshold: flush_threshold.max(1),
            covered: None,
            records: Vec::new(),
        }
    }

    /// Adds the records fetched for `[from, to]`.
    ///
    /// Ranges must be appended in ascending order without gaps.
    pub fn append(&mut self, from: BlockNum, to: BlockNum, records: impl IntoIterator<Item = RawRecord>) {
        self.covered = match self.covered {
            None => Some((from, to)),
            Some((first, last)) => {
                debug_assert_eq!(from, last + 1, "appended range must follow the covered range");
                Some((first, to.max(last)))
            }
        };
        self.records.extend(records);
    }

    /// Number of blocks covered since the last flush.
    pub fn span(&self) -> u64 {
        self.covered.map_or(0, |(first, last)| last - first + 1)
    }

    pub fn first_block(&self) -> Option<BlockNum> {
        self.covered.map(|(first, _)| first)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Whether the current batch must be flushed now.
    ///
    /// True once the covered span reaches the flush threshold, or when `is_final_range` says the
    /// stream reached its target, but never for a batch without records.
    pub fn should_flush(&self, is_final_range: bool) -> bool {
        !self.records.is_empty() && (is_final_range || self.span() >= self.flush_threshold)
    }

    /// Last block the next fetch starting at `cursor` may cover without carrying the batch past
    /// the flush threshold.
    pub fn flush_limit(&self, cursor: BlockNum) -> BlockNum {
        let first = self.first_block().unwrap_or(cursor);
        let limit = first.saturating_add(self.flush_threshold - 1);
        if limit < cursor {
            // Empty span already past the threshold, the next records close it.
            BlockNum::MAX
        } else {
            limit
        }
    }

    /// Detaches the current batch and starts an empty one.
    ///
    /// Returns `None` if nothing was appended since the last reset.
    pub fn take_and_reset(&mut self) -> Option<Batch> {
        let (first_block, last_block) = self.covered.take()?;
        Some(Batch {
            kind: self.kind,
            first_block,
            last_block,
            records: std::mem::take(&mut self.records),
        })
    }

    /// Puts back a batch whose flush failed so the same flush can be retried.
    ///
    /// Must be called before anything else is appended.
    pub fn restore(&mut self, batch: Batch) {
        debug_assert!(self.covered.is_none() && self.records.is_empty());
        self.covered = Some((batch.first_block, batch.last_block));
        self.records = batch.records;
    }
}
