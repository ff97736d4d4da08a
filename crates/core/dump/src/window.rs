use common::BlockNum;

/// Block range size of the next ranged query of one stream.
///
/// The window only ever shrinks: it is halved on each overflow, never below the configured
/// minimum, and is not grown back after successful queries. It lives in memory only and starts
/// again from the configured size after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveWindow {
    size: u64,
    min: u64,
}

impl AdaptiveWindow {
    pub fn new(size: u64, min: u64) -> Self {
        let min = min.max(1);
        Self {
            size: size.max(min),
            min,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Halves the span of the query that overflowed, flooring at the minimum.
    ///
    /// `requested` is the number of blocks actually requested, which is less than the window
    /// when the query was clamped to a flush boundary or the target. Halving the requested span
    /// guarantees the retry covers fewer blocks than the failed query.
    ///
    /// Returns `false` if the requested span was already at the minimum, in which case shrinking
    /// cannot help and the overflow has to be handled as an ordinary transient failure.
    pub fn shrink(&mut self, requested: u64) -> bool {
        let current = self.size.min(requested);
        if current <= self.min {
            return false;
        }
        self.size = (current / 2).max(self.min);
        true
    }

    /// The inclusive range starting at `start` covered by the current window, clamped to `end`.
    pub fn range(&self, start: BlockNum, end: BlockNum) -> (BlockNum, BlockNum) {
        let last = start.saturating_add(self.size - 1).min(end);
        (start, last)
    }
}
