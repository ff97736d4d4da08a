use alloy::transports::{RpcError, TransportError, TransportErrorKind};
use common::{BlockNum, FetchError, FetchErrorKind, RecordError};

/// Fragments of JSON-RPC error messages nodes use to report that a query would return more
/// results than they are willing to serve. Matched case-insensitively.
const OVERFLOW_MESSAGES: &[&str] = &[
    "query returned more than",
    "too many results",
    "response size",
    "result set too large",
    "maximum block range",
    "block range too large",
    "block range is too large",
];

/// Fragments of JSON-RPC error messages reporting request rate limits. Matched
/// case-insensitively, before [`OVERFLOW_MESSAGES`]: providers send these with the same
/// "limit exceeded" code (-32005) they use for result set limits.
const RATE_LIMIT_MESSAGES: &[&str] = &["rate limit", "request count", "too many requests"];

/// JSON-RPC codes of requests the node will never accept: invalid request, method not found,
/// invalid params.
const FATAL_CODES: &[i64] = &[-32600, -32601, -32602];

/// A failed JSON-RPC request.
#[derive(Debug, thiserror::Error)]
#[error("JSON-RPC request {method} failed")]
pub struct RpcRequestError {
    pub method: &'static str,
    #[source]
    pub source: TransportError,
}

impl RpcRequestError {
    /// Wraps the error in a [`FetchError`] classified by [`classify`].
    pub fn into_fetch_error(self) -> FetchError {
        FetchError {
            kind: classify(&self.source),
            source: self.into(),
        }
    }
}

/// A request succeeded but the response cannot be used.
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    /// The node returned `null` for a block it does not have yet.
    ///
    /// Common right after the block was produced, or behind a load balancer whose nodes are not
    /// in sync. Retrying usually succeeds.
    #[error("node returned no block {0}")]
    MissingBlock(BlockNum),

    /// Same as [`ResponseError::MissingBlock`] for `eth_getBlockReceipts`.
    #[error("node returned no receipts for block {0}")]
    MissingReceipts(BlockNum),

    /// A returned record has no usable block number.
    #[error("unusable record in {method} response")]
    Record {
        method: &'static str,
        #[source]
        source: RecordError,
    },
}

impl ResponseError {
    pub fn into_fetch_error(self) -> FetchError {
        match self {
            ResponseError::MissingBlock(_) | ResponseError::MissingReceipts(_) => {
                FetchError::transient(self)
            }
            // The node answers with the same malformed record every time.
            ResponseError::Record { .. } => FetchError::fatal(self),
        }
    }
}

/// Decides how the extraction loop should react to a failed request.
///
/// - JSON-RPC errors reporting a result set limit, and HTTP 413, are overflows. Rate limits are
///   not.
/// - Invalid requests, unknown methods, invalid params, HTTP 401/403 and requests that cannot be
///   serialized are fatal.
/// - Everything else (timeouts, dropped connections, 429 and 5xx responses, bodies that do not
///   decode) is transient.
pub fn classify(err: &TransportError) -> FetchErrorKind {
    match err {
        RpcError::ErrorResp(payload) => classify_payload(payload.code, &payload.message),
        RpcError::Transport(TransportErrorKind::HttpError(http)) => match http.status {
            413 => FetchErrorKind::Overflow,
            401 | 403 => FetchErrorKind::Fatal,
            _ => FetchErrorKind::Transient,
        },
        RpcError::SerError(_) | RpcError::LocalUsageError(_) | RpcError::UnsupportedFeature(_) => {
            FetchErrorKind::Fatal
        }
        _ => FetchErrorKind::Transient,
    }
}

/// Classifies a JSON-RPC error object by its code and message.
///
/// The message decides first: several providers report result set limits with the generic
/// invalid-params or server-error codes, and the "limit exceeded" code is shared between result
/// set and rate limits. Rate limits are transient so they never shrink a query window.
pub fn classify_payload(code: i64, message: &str) -> FetchErrorKind {
    let message = message.to_lowercase();
    let mentions = |fragments: &[&str]| fragments.iter().any(|fragment| message.contains(fragment));

    if mentions(RATE_LIMIT_MESSAGES) {
        FetchErrorKind::Transient
    } else if mentions(OVERFLOW_MESSAGES) {
        FetchErrorKind::Overflow
    } else if FATAL_CODES.contains(&code) {
        FetchErrorKind::Fatal
    } else {
        FetchErrorKind::Transient
    }
}

/// Error creating the JSON-RPC client.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Only HTTP(S) endpoints are supported.
    #[error("unsupported RPC URL scheme '{0}', expected http or https")]
    UnsupportedScheme(String),

    #[error("failed to build HTTP client")]
    HttpClient(#[source] alloy::transports::http::reqwest::Error),
}
