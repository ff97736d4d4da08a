//! JSON-RPC access to EVM nodes for the extraction pipeline.
//!
//! [`JsonRpcClient`] implements [`common::RangeFetcher`] on top of an alloy provider and
//! classifies node errors into overflow, transient and fatal failures, see [`error::classify`].

mod client;
pub mod error;

pub use self::{
    client::JsonRpcClient,
    error::{ProviderError, ResponseError, RpcRequestError},
};
