//! The four independently checkpointed extraction streams.

/// One of the four extraction streams.
///
/// The kind decides how a stream queries the node (one call per block, or one ranged call per
/// window) and names its output folder and checkpoint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamKind {
    Blocks,
    Receipts,
    Logs,
    Traces,
}

impl StreamKind {
    /// All stream kinds, in the order they are reported.
    pub const ALL: [StreamKind; 4] = [
        StreamKind::Blocks,
        StreamKind::Receipts,
        StreamKind::Logs,
        StreamKind::Traces,
    ];

    /// Returns the canonical name, used for folders, checkpoint files and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            StreamKind::Blocks => "blocks",
            StreamKind::Receipts => "receipts",
            StreamKind::Logs => "logs",
            StreamKind::Traces => "traces",
        }
    }

    /// Whether the stream is fetched with ranged queries that can overflow the node's result
    /// size limit. Ranged streams get an adaptive window, per-block streams do not.
    pub const fn is_ranged(self) -> bool {
        matches!(self, StreamKind::Logs | StreamKind::Traces)
    }

    /// The JSON field holding the block number in records of this kind.
    pub const fn block_number_field(self) -> &'static str {
        match self {
            StreamKind::Blocks => "number",
            StreamKind::Receipts | StreamKind::Logs | StreamKind::Traces => "blockNumber",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

impl std::str::FromStr for StreamKind {
    type Err = StreamKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StreamKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| StreamKindError(s.to_string()))
    }
}

impl serde::Serialize for StreamKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for StreamKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error returned when parsing an unknown stream kind.
#[derive(Debug, thiserror::Error)]
#[error("invalid stream kind: {0}, expected one of: blocks, receipts, logs, traces")]
pub struct StreamKindError(String);
