use std::time::Duration;

use alloy::{
    network::AnyNetwork,
    providers::{Provider as _, ProviderBuilder, RootProvider},
    rpc::{
        client::ClientBuilder,
        json_rpc::{RpcRecv, RpcSend},
    },
    transports::http::{Http, reqwest},
};
use async_trait::async_trait;
use common::{
    BlockNum, FetchError, RangeFetcher, RawRecord, StreamKind,
    record::{parse_block_num, to_hex},
};
use serde_json::{Value, json};
use tracing::{instrument, trace};
use url::Url;

use crate::error::{ProviderError, ResponseError, RpcRequestError};

/// JSON-RPC client for EVM nodes serving the `eth_*` and `trace_*` namespaces over HTTP(S).
///
/// Records are returned as the node sent them. Concurrency is bounded by the caller, this client
/// sends every request it is given right away.
#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    provider: RootProvider<AnyNetwork>,
    url: Url,
}

impl JsonRpcClient {
    /// Creates a client for the node at `url`. Requests that take longer than `request_timeout`
    /// fail with a transient error.
    pub fn new(url: Url, request_timeout: Duration) -> Result<Self, ProviderError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProviderError::UnsupportedScheme(url.scheme().to_string()));
        }

        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(ProviderError::HttpClient)?;
        let transport = Http::with_client(http_client, url.clone());
        let is_local = transport.guess_local();
        let client = ClientBuilder::default().transport(transport, is_local);

        let provider = ProviderBuilder::new()
            .disable_recommended_fillers()
            .network::<AnyNetwork>()
            .connect_client(client);

        Ok(Self { provider, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn request<Params, Resp>(
        &self,
        method: &'static str,
        params: Params,
    ) -> Result<Resp, FetchError>
    where
        Params: RpcSend,
        Resp: RpcRecv,
    {
        trace!(method, "sending request");
        self.provider
            .client()
            .request(method, params)
            .await
            .map_err(|source| RpcRequestError { method, source }.into_fetch_error())
    }

    /// Runs a ranged filter query (`eth_getLogs`, `trace_filter`) over `[from, to]`.
    async fn filter(
        &self,
        method: &'static str,
        kind: StreamKind,
        from: BlockNum,
        to: BlockNum,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let filter = json!({ "fromBlock": to_hex(from), "toBlock": to_hex(to) });
        let values: Vec<Value> = self.request(method, [filter]).await?;
        into_records(method, kind, values)
    }
}

#[async_trait]
impl RangeFetcher for JsonRpcClient {
    #[instrument(skip(self), err)]
    async fn fetch_block(&self, block_num: BlockNum) -> Result<RawRecord, FetchError> {
        const METHOD: &str = "eth_getBlockByNumber";
        let block: Option<Value> = self.request(METHOD, (to_hex(block_num), true)).await?;
        let block = block.ok_or_else(|| ResponseError::MissingBlock(block_num).into_fetch_error())?;
        into_record(METHOD, StreamKind::Blocks, block)
    }

    #[instrument(skip(self), err)]
    async fn fetch_receipts(&self, block_num: BlockNum) -> Result<Vec<RawRecord>, FetchError> {
        const METHOD: &str = "eth_getBlockReceipts";
        let receipts: Option<Vec<Value>> = self.request(METHOD, [to_hex(block_num)]).await?;
        let receipts =
            receipts.ok_or_else(|| ResponseError::MissingReceipts(block_num).into_fetch_error())?;
        into_records(METHOD, StreamKind::Receipts, receipts)
    }

    #[instrument(skip(self), err)]
    async fn fetch_logs(&self, from: BlockNum, to: BlockNum) -> Result<Vec<RawRecord>, FetchError> {
        self.filter("eth_getLogs", StreamKind::Logs, from, to).await
    }

    #[instrument(skip(self), err)]
    async fn fetch_traces(
        &self,
        from: BlockNum,
        to: BlockNum,
    ) -> Result<Vec<RawRecord>, FetchError> {
        self.filter("trace_filter", StreamKind::Traces, from, to).await
    }

    #[instrument(skip(self), err)]
    async fn latest_block(&self, finalized: bool) -> Result<BlockNum, FetchError> {
        const METHOD: &str = "eth_getBlockByNumber";
        let tag = if finalized { "finalized" } else { "latest" };
        let block: Option<Value> = self.request(METHOD, (tag, false)).await?;
        // Chains without finality have no finalized block yet.
        let Some(block) = block else {
            return Ok(0);
        };
        let number = block
            .get("number")
            .ok_or(common::RecordError::Missing("number"))
            .and_then(parse_block_num)
            .map_err(|source| ResponseError::Record { method: METHOD, source }.into_fetch_error())?;
        Ok(number)
    }
}

fn into_record(method: &'static str, kind: StreamKind, value: Value) -> Result<RawRecord, FetchError> {
    RawRecord::from_json(kind, value)
        .map_err(|source| ResponseError::Record { method, source }.into_fetch_error())
}

fn into_records(
    method: &'static str,
    kind: StreamKind,
    values: Vec<Value>,
) -> Result<Vec<RawRecord>, FetchError> {
    values
        .into_iter()
        .map(|value| into_record(method, kind, value))
        .collect()
}
