use chrono::{DateTime, NaiveDate, Utc};
use common::{BlockNum, StreamKind};

/// Location of the output file of one flushed batch.
///
/// Formatted as `{stream}/date={YYYY-MM-DD}/block_range={first:09}_{last:09}/{stream}.parquet`.
/// Block numbers are zero padded so keys sort in block order. The date is the UTC date at flush
/// time, not the date of the blocks, so a batch re-generated on a later day gets a different key.
/// For a fixed date the key is unique per `(stream, first, last)`, and re-flushing the same range
/// overwrites the previous output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub kind: StreamKind,
    pub date: NaiveDate,
    pub first_block: BlockNum,
    pub last_block: BlockNum,
}

impl PartitionKey {
    pub fn new(kind: StreamKind, first_block: BlockNum, last_block: BlockNum, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            date: now.date_naive(),
            first_block,
            last_block,
        }
    }

    /// The relative path of the file, using `/` separators. Also used as the archive object key.
    pub fn path(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{kind}/date={date}/block_range={first:09}_{last:09}/{kind}.parquet",
            kind = self.kind,
            date = self.date.format("%Y-%m-%d"),
            first = self.first_block,
            last = self.last_block,
        )
    }
}
