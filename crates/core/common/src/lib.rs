//! Types shared by the extraction pipeline, the RPC extractors and the binary.

pub mod fetch;
pub mod record;
pub mod store;
pub mod stream_kind;

pub use self::{
    fetch::{FetchError, FetchErrorKind, RangeFetcher},
    record::{RawRecord, RecordError},
    stream_kind::{StreamKind, StreamKindError},
};

/// Block number type alias.
pub type BlockNum = u64;

pub type BoxError = Box<dyn std::error::Error + Sync + Send + 'static>;
