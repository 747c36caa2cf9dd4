//! Typed read and signing calls over a provider handle.

use std::sync::Arc;

use alloy::primitives::{Address, Bytes, U256, hex};
use alloy::rpc::types::TransactionRequest;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::{Value, json};

use super::{Eip1193, ProviderEvent, SharedProvider, parse_accounts, parse_chain_id, parse_quantity};
use crate::ChainId;
use crate::error::RpcError;

/// Typed client over a [`SharedProvider`].
///
/// Cheap to clone; every clone shares the same handle, so concurrent reads
/// are fine.
#[derive(Debug, Clone)]
pub struct ChainClient {
    provider: SharedProvider,
}

impl ChainClient {
    /// Wrap a provider handle.
    #[must_use]
    pub const fn new(provider: SharedProvider) -> Self {
        Self { provider }
    }

    /// The underlying handle.
    #[must_use]
    pub fn provider(&self) -> &SharedProvider {
        &self.provider
    }

    /// Returns `true` if both clients share the same handle.
    #[must_use]
    pub fn same_provider(&self, other: &SharedProvider) -> bool {
        Arc::ptr_eq(&self.provider, other)
    }

    /// Accounts exposed without prompting.
    pub async fn accounts(&self) -> Result<Vec<Address>, RpcError> {
        let value = self.provider.request("eth_accounts", json!([])).await?;
        parse_accounts(&value)
    }

    /// Current chain id.
    pub async fn chain_id(&self) -> Result<ChainId, RpcError> {
        let value = self.provider.request("eth_chainId", json!([])).await?;
        parse_chain_id(&value)
    }

    /// Latest block number.
    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let value = self.provider.request("eth_blockNumber", json!([])).await?;
        value
            .as_str()
            .ok_or_else(|| RpcError::internal(format!("invalid block number: {value}")))
            .and_then(parse_quantity)
    }

    /// Native balance of `address` at the latest block, in wei.
    pub async fn balance(&self, address: Address) -> Result<U256, RpcError> {
        let value = self
            .provider
            .request("eth_getBalance", json!([address, "latest"]))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::internal(format!("invalid balance: {e}")))
    }

    /// Read-only contract call at the latest block.
    pub async fn call(&self, request: &TransactionRequest) -> Result<Bytes, RpcError> {
        let value = self
            .provider
            .request("eth_call", json!([request, "latest"]))
            .await?;
        serde_json::from_value(value).map_err(|e| RpcError::internal(format!("invalid call result: {e}")))
    }

    /// EIP-191 personal signature by `account`, hex encoded with `0x`.
    pub async fn sign_message(&self, account: Address, message: &[u8]) -> Result<String, RpcError> {
        let payload = hex::encode_prefixed(message);
        let value = self
            .provider
            .request("personal_sign", json!([payload, account]))
            .await?;
        match value {
            Value::String(sig) => Ok(sig),
            other => Err(RpcError::internal(format!("invalid signature: {other}"))),
        }
    }

    /// Stream of new block numbers.
    #[must_use]
    pub fn blocks(&self) -> BoxStream<'static, u64> {
        self.provider
            .subscribe()
            .filter_map(|event| async move {
                match event {
                    ProviderEvent::Block(n) => Some(n),
                    _ => None,
                }
            })
            .boxed()
    }
}

impl From<SharedProvider> for ChainClient {
    fn from(provider: SharedProvider) -> Self {
        Self::new(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockProvider, TEST_ADDRESS};

    #[tokio::test]
    async fn test_typed_reads() {
        let mock = MockProvider::new();
        mock.respond("eth_chainId", json!("0x5"));
        mock.respond("eth_blockNumber", json!("0x1b4"));
        mock.respond("eth_getBalance", json!("0xde0b6b3a7640000"));
        mock.respond("eth_accounts", json!([TEST_ADDRESS]));
        let client = ChainClient::new(Arc::new(mock));

        assert_eq!(client.chain_id().await.unwrap(), 5);
        assert_eq!(client.block_number().await.unwrap(), 436);
        let address: Address = TEST_ADDRESS.parse().unwrap();
        assert_eq!(
            client.balance(address).await.unwrap(),
            U256::from(1_000_000_000_000_000_000_u128)
        );
        assert_eq!(client.accounts().await.unwrap(), vec![address]);
    }

    #[tokio::test]
    async fn test_block_stream_filters_other_events() {
        let mock = Arc::new(MockProvider::new());
        let provider: SharedProvider = mock.clone();
        let client = ChainClient::new(Arc::clone(&provider));
        let mut blocks = client.blocks();

        mock.emit(ProviderEvent::ChainChanged(3));
        mock.emit(ProviderEvent::Block(9));

        assert_eq!(blocks.next().await, Some(9));
        assert!(client.same_provider(&provider));
    }
}
