//! JSON-RPC transport used for read calls.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use alloy::network::Ethereum;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::transports::TransportError;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::RpcError;

/// A raw JSON-RPC request sink.
#[async_trait]
pub trait RpcTransport: Send + Sync + fmt::Debug {
    /// Forward a request to the node.
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

/// HTTP JSON-RPC transport backed by an alloy provider.
pub struct HttpTransport {
    url: String,
    provider: DynProvider<Ethereum>,
    timeout: Option<Duration>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Connect to a JSON-RPC endpoint.
    pub async fn connect(url: &str, timeout: Option<Duration>) -> Result<Self, RpcError> {
        let provider = ProviderBuilder::new()
            .connect(url)
            .await
            .map_err(|e| RpcError::internal(format!("failed to connect to '{url}': {e}")))?
            .erased();
        debug!(url, "RPC transport connected");
        Ok(Self {
            url: url.to_owned(),
            provider,
            timeout,
        })
    }

    /// The endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let call = self
            .provider
            .raw_request::<Value, Value>(Cow::Owned(method.to_owned()), params);
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| RpcError::internal(format!("'{method}' timed out after {limit:?}")))?,
            None => call.await,
        };
        result.map_err(rpc_error)
    }
}

fn rpc_error(err: TransportError) -> RpcError {
    match err.as_error_resp() {
        Some(payload) => RpcError::new(payload.code, payload.message.to_string()),
        None => RpcError::internal(err.to_string()),
    }
}
