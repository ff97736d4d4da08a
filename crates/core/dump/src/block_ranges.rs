use common::{BlockNum, FetchError, RangeFetcher};
use tracing::instrument;

/// Target height configuration for an extraction run.
///
/// Defines where the streams stop:
/// - `Latest`: Stop at the latest available block
/// - `Absolute(N)`: Stop at specific block number N
/// - `LatestMinus(N)`: Stop at latest block - N (e.g., 100 means latest - 100)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum EndBlock {
    /// Stop at the latest available block
    #[default]
    Latest,
    /// Stop at a specific block number
    Absolute(BlockNum),
    /// Stop N blocks before the latest block
    LatestMinus(u64),
}

impl EndBlock {
    /// Builds an end block from a signed height: non-negative values are absolute, negative
    /// values are relative to the latest block.
    pub fn from_signed(n: i64) -> Self {
        if n >= 0 {
            EndBlock::Absolute(n as BlockNum)
        } else {
            EndBlock::LatestMinus(n.unsigned_abs())
        }
    }

    /// Resolves the end block to a concrete block number, asking the node for its latest block
    /// only when the target is relative.
    #[instrument(skip(fetcher), err)]
    pub async fn resolve(
        &self,
        fetcher: &dyn RangeFetcher,
        finalized: bool,
    ) -> Result<BlockNum, ResolutionError> {
        match *self {
            EndBlock::Absolute(n) => Ok(n),
            EndBlock::Latest => {
                let latest = fetcher
                    .latest_block(finalized)
                    .await
                    .map_err(ResolutionError::FetchLatestFailed)?;
                resolve_relative(None, latest)
            }
            EndBlock::LatestMinus(offset) => {
                let latest = fetcher
                    .latest_block(finalized)
                    .await
                    .map_err(ResolutionError::FetchLatestFailed)?;
                resolve_relative(Some(offset), latest)
            }
        }
    }
}

impl std::fmt::Display for EndBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndBlock::Latest => write!(f, "latest"),
            EndBlock::Absolute(n) => write!(f, "{}", n),
            EndBlock::LatestMinus(n) => write!(f, "-{}", n),
        }
    }
}

impl std::str::FromStr for EndBlock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(EndBlock::Latest),
            s => s
                .parse::<i64>()
                .map(EndBlock::from_signed)
                .map_err(|_| format!("invalid end block value: '{}'", s)),
        }
    }
}

impl<'de> serde::Deserialize<'de> for EndBlock {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // TOML users write `end_block = 1000` as often as `end_block = "latest"`.
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Ok(EndBlock::from_signed(n)),
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Resolves the end block number relative to the latest block.
///
/// `offset` blocks are subtracted from `latest_block`; without an offset the end block is
/// `latest_block` itself.
///
/// Returns an error if the offset reaches below the genesis block.
pub fn resolve_relative(
    offset: Option<u64>,
    latest_block: BlockNum,
) -> Result<BlockNum, ResolutionError> {
    match offset {
        None => Ok(latest_block),
        Some(offset) => latest_block
            .checked_sub(offset)
            .ok_or(ResolutionError::BeforeGenesis {
                latest_block,
                offset,
            }),
    }
}

/// Errors that can occur when resolving the target block
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    /// Failed to fetch the latest block number
    #[error("failed to fetch latest block")]
    FetchLatestFailed(#[source] FetchError),

    /// The relative offset is larger than the chain
    #[error("end block latest-{offset} is before genesis (latest block is {latest_block})")]
    BeforeGenesis { latest_block: BlockNum, offset: u64 },
}

#[cfg(test)]
mod tests {
    use super::{EndBlock, resolve_relative};

    #[test]
    fn resolve_relative_variants() {
        //* Params
        let latest_block = 100;
        let test_cases = [
            (None, 100),     // No offset, defaults to latest
            (Some(50), 50),  // latest - 50
            (Some(100), 0),  // down to genesis
        ];

        //* Test
        for (offset, expected) in test_cases {
            let result = resolve_relative(offset, latest_block).unwrap();
            assert_eq!(expected, result);
        }
    }

    #[test]
    fn resolve_relative_before_genesis_fails() {
        assert!(resolve_relative(Some(101), 100).is_err());
    }

    #[test]
    fn end_block_from_str() {
        assert_eq!("latest".parse::<EndBlock>().unwrap(), EndBlock::Latest);
        assert_eq!("100".parse::<EndBlock>().unwrap(), EndBlock::Absolute(100));
        assert_eq!("0".parse::<EndBlock>().unwrap(), EndBlock::Absolute(0));
        assert_eq!(
            "-50".parse::<EndBlock>().unwrap(),
            EndBlock::LatestMinus(50)
        );
        assert!("invalid".parse::<EndBlock>().is_err());
    }

    #[test]
    fn end_block_display() {
        assert_eq!(EndBlock::Latest.to_string(), "latest");
        assert_eq!(EndBlock::Absolute(100).to_string(), "100");
        assert_eq!(EndBlock::LatestMinus(50).to_string(), "-50");
    }

    #[test]
    fn end_block_deserializes_from_int_or_string() {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            end_block: EndBlock,
        }

        let cases = [
            (r#"{"end_block": 999}"#, EndBlock::Absolute(999)),
            (r#"{"end_block": -10}"#, EndBlock::LatestMinus(10)),
            (r#"{"end_block": "latest"}"#, EndBlock::Latest),
            (r#"{"end_block": "-5"}"#, EndBlock::LatestMinus(5)),
        ];

        for (input, expected) in cases {
            let parsed: Wrapper = serde_json::from_str(input).unwrap();
            assert_eq!(parsed.end_block, expected, "input: {input}");
        }
    }
}
