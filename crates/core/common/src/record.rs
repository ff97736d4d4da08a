use serde_json::Value;

use crate::{BlockNum, StreamKind};

/// A record as returned by the node: a block, a receipt, a log entry or a trace entry.
///
/// The payload is kept verbatim. Only the block number is extracted, since it drives ordering,
/// batching and partition naming.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    block_num: BlockNum,
    value: Value,
}

impl RawRecord {
    /// Wraps a JSON object returned by the node, reading its block number from the field that
    /// records of `kind` carry it in.
    pub fn from_json(kind: StreamKind, value: Value) -> Result<Self, RecordError> {
        let field = kind.block_number_field();
        let raw = value.get(field).ok_or(RecordError::Missing(field))?;
        let block_num = parse_block_num(raw)?;
        Ok(Self { block_num, value })
    }

    pub fn block_num(&self) -> BlockNum {
        self.block_num
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// Parses a block number encoded as a `0x` hex string, a decimal string or a JSON integer.
pub fn parse_block_num(value: &Value) -> Result<BlockNum, RecordError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| RecordError::InvalidBlockNumber(n.to_string())),
        Value::String(s) => {
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => BlockNum::from_str_radix(hex, 16),
                None => s.parse(),
            };
            parsed.map_err(|_| RecordError::InvalidBlockNumber(s.clone()))
        }
        other => Err(RecordError::InvalidBlockNumber(other.to_string())),
    }
}

/// Encodes a block number the way JSON-RPC nodes expect it.
pub fn to_hex(block_num: BlockNum) -> String {
    format!("{block_num:#x}")
}

/// Errors reading the block number out of a node record.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The record has no block number field.
    #[error("missing field: {0}")]
    Missing(&'static str),

    /// The block number field is not a non-negative integer, hex or decimal string.
    #[error("invalid block number: {0}")]
    InvalidBlockNumber(String),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_block_num_accepts_node_encodings() {
        let cases = [
            (json!("0x3e8"), 1000),
            (json!("0X10"), 16),
            (json!("1000"), 1000),
            (json!(42), 42),
            (json!("0x0"), 0),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_block_num(&input).expect("should parse"), expected);
        }
    }

    #[test]
    fn parse_block_num_rejects_garbage() {
        for input in [json!("0xzz"), json!(-1), json!(null), json!("ten")] {
            assert!(parse_block_num(&input).is_err(), "{input} should not parse");
        }
    }

    #[test]
    fn from_json_reads_the_kind_specific_field() {
        //* Given
        let block = json!({"number": "0x10", "hash": "0xabc"});
        let log = json!({"blockNumber": "0x11", "logIndex": "0x0"});

        //* When
        let block = RawRecord::from_json(StreamKind::Blocks, block).expect("valid block");
        let log = RawRecord::from_json(StreamKind::Logs, log).expect("valid log");

        //* Then
        assert_eq!(block.block_num(), 16);
        assert_eq!(log.block_num(), 17);
        assert_eq!(log.value()["logIndex"], "0x0");
    }

    #[test]
    fn from_json_without_block_number_fails() {
        let err = RawRecord::from_json(StreamKind::Receipts, json!({"number": "0x1"})).unwrap_err();
        assert!(matches!(err, RecordError::Missing("blockNumber")));
    }

    #[test]
    fn to_hex_is_prefixed() {
        assert_eq!(to_hex(1000), "0x3e8");
        assert_eq!(to_hex(0), "0x0");
    }
}
