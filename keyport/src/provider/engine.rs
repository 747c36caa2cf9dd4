//! Locally composed provider for raw-secret and hardware connectors.
//!
//! The engine answers account and signing methods itself, serves repeat reads
//! from a [`ReadCache`], and forwards everything else to an [`RpcTransport`].
//! While started, a polling loop tracks the chain head and emits
//! [`ProviderEvent::Block`]. Block-scoped reads are only cached while that
//! loop runs, since nothing else invalidates them.
//!
//! [`ProviderEngine::close`] drops the signer. Handles kept by the
//! application stop working at that point: every request fails with
//! [`RpcError::DISCONNECTED`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use alloy::primitives::{Address, Bytes, hex};
use alloy::signers::Signer;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::{
    CachePolicy, EventBus, EventStream, Eip1193, ProviderEvent, ReadCache, RpcTransport,
    parse_quantity, quantity,
};
use crate::ChainId;
use crate::error::{ActivationError, RpcError};

/// The signing layer of a [`ProviderEngine`].
#[async_trait]
pub trait AccountSigner: Send + Sync + fmt::Debug {
    /// Accounts controlled by this signer, primary first.
    async fn accounts(&self) -> Result<Vec<Address>, RpcError>;

    /// EIP-191 personal signature over `message`, as 65 raw bytes.
    async fn sign_message(&self, account: Address, message: &[u8]) -> Result<Bytes, RpcError>;
}

/// Signer backed by a private key held in memory.
///
/// The key lives inside alloy's `PrivateKeySigner`, which zeroizes it on drop.
pub struct LocalKeySigner {
    signer: PrivateKeySigner,
}

impl fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("address", &self.signer.address())
            .finish_non_exhaustive()
    }
}

impl LocalKeySigner {
    /// Create a signer from a hex private key, with or without `0x`.
    pub fn from_hex(key: &str, chain_id: ChainId) -> Result<Self, ActivationError> {
        let key = key.strip_prefix("0x").unwrap_or(key);
        let mut signer = key
            .parse::<PrivateKeySigner>()
            .map_err(|e| ActivationError::invalid_secret(format!("invalid private key: {e}")))?;
        signer.set_chain_id(Some(chain_id));
        Ok(Self { signer })
    }

    /// The signer's address.
    #[must_use]
    pub fn address(&self) -> Address {
        self.signer.address()
    }
}

#[async_trait]
impl AccountSigner for LocalKeySigner {
    async fn accounts(&self) -> Result<Vec<Address>, RpcError> {
        Ok(vec![self.signer.address()])
    }

    async fn sign_message(&self, account: Address, message: &[u8]) -> Result<Bytes, RpcError> {
        if account != self.signer.address() {
            return Err(RpcError::new(
                RpcError::UNAUTHORIZED,
                format!("account {account} is not controlled by this signer"),
            ));
        }
        let sig = self
            .signer
            .sign_message(message)
            .await
            .map_err(|e| RpcError::internal(format!("message signing failed: {e}")))?;
        Ok(Bytes::from(sig.as_bytes().to_vec()))
    }
}

struct EngineShared {
    chain_id: ChainId,
    signer: Mutex<Option<Arc<dyn AccountSigner>>>,
    transport: Arc<dyn RpcTransport>,
    cache: ReadCache,
    events: EventBus,
}

impl EngineShared {
    fn signer(&self) -> Result<Arc<dyn AccountSigner>, RpcError> {
        self.signer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(RpcError::disconnected)
    }
}

/// Provider composed from a signer, a read cache and an RPC transport.
pub struct ProviderEngine {
    shared: Arc<EngineShared>,
    polling_interval: Duration,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ProviderEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderEngine")
            .field("chain_id", &self.shared.chain_id)
            .field("closed", &self.is_closed())
            .field("transport", &self.shared.transport)
            .field("polling_interval", &self.polling_interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ProviderEngine {
    /// Compose an engine. Call [`start`](Self::start) to begin block polling.
    #[must_use]
    pub fn new(
        chain_id: ChainId,
        signer: Arc<dyn AccountSigner>,
        transport: Arc<dyn RpcTransport>,
        polling_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                chain_id,
                signer: Mutex::new(Some(signer)),
                transport,
                cache: ReadCache::new(),
                events: EventBus::new(),
            }),
            polling_interval,
            poller: Mutex::new(None),
        }
    }

    /// The chain this engine serves.
    #[must_use]
    pub fn chain_id(&self) -> ChainId {
        self.shared.chain_id
    }

    /// Start the block-polling loop. Idempotent.
    ///
    /// A zero polling interval disables polling, and a closed engine never
    /// starts again.
    pub fn start(&self) {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_some() || self.polling_interval.is_zero() || self.is_closed() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let period = self.polling_interval;
        *poller = Some(tokio::spawn(poll_blocks(shared, period)));
        debug!(chain_id = self.shared.chain_id, ?period, "provider engine started");
    }

    /// Stop the block-polling loop. Idempotent.
    pub fn stop(&self) {
        let handle = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            self.shared.cache.new_block();
            debug!(chain_id = self.shared.chain_id, "provider engine stopped");
        }
    }

    /// Stop polling and drop the signer. Idempotent.
    ///
    /// Every later request on this engine, including through provider
    /// handles cloned earlier, fails with a disconnected error.
    pub fn close(&self) {
        self.stop();
        let signer = self
            .shared
            .signer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if signer.is_some() {
            self.shared.cache.clear();
            debug!(chain_id = self.shared.chain_id, "provider engine closed");
        }
    }

    /// Returns `true` once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared
            .signer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Whether `method`'s result may be served from the cache right now.
    fn cacheable(&self, method: &str) -> bool {
        match CachePolicy::for_method(method) {
            CachePolicy::Permanent => true,
            CachePolicy::Block => self.is_running(),
            CachePolicy::Never => false,
        }
    }

    /// Returns `true` while the polling loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Publish an event to subscribers.
    pub fn emit(&self, event: ProviderEvent) {
        self.shared.events.emit(event);
    }

    async fn personal_sign(
        signer: &dyn AccountSigner,
        params: &Value,
        message_first: bool,
    ) -> Result<Value, RpcError> {
        let (message_idx, account_idx) = if message_first { (0, 1) } else { (1, 0) };
        let message = params
            .get(message_idx)
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("missing message"))?;
        let account = params
            .get(account_idx)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Address>().ok())
            .ok_or_else(|| RpcError::invalid_params("missing or invalid account"))?;
        let bytes = decode_message(message);
        let sig = signer.sign_message(account, &bytes).await?;
        Ok(Value::String(hex::encode_prefixed(sig)))
    }
}

impl Drop for ProviderEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl Eip1193 for ProviderEngine {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        trace!(method, "engine request");
        let signer = self.shared.signer()?;
        match method {
            "eth_accounts" | "eth_requestAccounts" => {
                let accounts = signer.accounts().await?;
                Ok(json!(
                    accounts
                        .iter()
                        .map(|a| a.to_checksum(None))
                        .collect::<Vec<_>>()
                ))
            }
            "eth_chainId" => Ok(quantity(self.shared.chain_id)),
            "net_version" => Ok(Value::String(self.shared.chain_id.to_string())),
            "personal_sign" => Self::personal_sign(signer.as_ref(), &params, true).await,
            "eth_sign" => Self::personal_sign(signer.as_ref(), &params, false).await,
            _ => {
                if !self.cacheable(method) {
                    return self.shared.transport.request(method, params).await;
                }
                if let Some(hit) = self.shared.cache.get(method, &params) {
                    trace!(method, "cache hit");
                    return Ok(hit);
                }
                let result = self.shared.transport.request(method, params.clone()).await?;
                self.shared.cache.insert(method, &params, &result);
                Ok(result)
            }
        }
    }

    fn subscribe(&self) -> EventStream {
        self.shared.events.subscribe()
    }
}

/// Decode a `personal_sign` payload: hex data if it parses as such, UTF-8 text otherwise.
fn decode_message(message: &str) -> Vec<u8> {
    message
        .strip_prefix("0x")
        .and_then(|h| hex::decode(h).ok())
        .unwrap_or_else(|| message.as_bytes().to_vec())
}

async fn poll_blocks(shared: Arc<EngineShared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: Option<u64> = None;
    loop {
        ticker.tick().await;
        let number = match shared.transport.request("eth_blockNumber", json!([])).await {
            Ok(Value::String(s)) => parse_quantity(&s),
            Ok(other) => Err(RpcError::internal(format!("invalid block number: {other}"))),
            Err(e) => Err(e),
        };
        match number {
            Ok(n) if last.is_none_or(|prev| n > prev) => {
                last = Some(n);
                shared.cache.new_block();
                shared.events.emit(ProviderEvent::Block(n));
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "block polling failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use futures::StreamExt;

    use super::*;
    use crate::test_support::{MockTransport, TEST_ADDRESS, TEST_PRIVATE_KEY};

    fn engine(transport: Arc<MockTransport>, interval: Duration) -> ProviderEngine {
        let signer = LocalKeySigner::from_hex(TEST_PRIVATE_KEY, 1).unwrap();
        ProviderEngine::new(1, Arc::new(signer), transport, interval)
    }

    #[test]
    fn test_local_signer_accepts_prefixed_and_bare_keys() {
        let bare = LocalKeySigner::from_hex(TEST_PRIVATE_KEY, 1).unwrap();
        let prefixed = LocalKeySigner::from_hex(&format!("0x{TEST_PRIVATE_KEY}"), 1).unwrap();
        assert_eq!(bare.address(), prefixed.address());
        assert_eq!(bare.address(), TEST_ADDRESS.parse::<Address>().unwrap());
    }

    #[test]
    fn test_local_signer_rejects_garbage() {
        let err = LocalKeySigner::from_hex("not-a-key", 1).unwrap_err();
        assert!(matches!(err, ActivationError::InvalidSecretMaterial(_)));
    }

    #[tokio::test]
    async fn test_engine_answers_account_methods_locally() {
        let transport = Arc::new(MockTransport::new());
        let engine = engine(Arc::clone(&transport), Duration::ZERO);

        let accounts = engine.request("eth_accounts", json!([])).await.unwrap();
        assert_eq!(accounts, json!([TEST_ADDRESS]));
        assert_eq!(engine.request("eth_chainId", json!([])).await.unwrap(), json!("0x1"));
        assert_eq!(engine.request("net_version", json!([])).await.unwrap(), json!("1"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_engine_signs_personal_messages() {
        let engine = engine(Arc::new(MockTransport::new()), Duration::ZERO);
        let sig = engine
            .request("personal_sign", json!(["0x68656c6c6f", TEST_ADDRESS]))
            .await
            .unwrap();
        let sig = sig.as_str().unwrap();
        assert!(sig.starts_with("0x"));
        assert_eq!(sig.len(), 2 + 130);

        let text_sig = engine
            .request("personal_sign", json!(["hello", TEST_ADDRESS]))
            .await
            .unwrap();
        assert_eq!(text_sig.as_str().unwrap(), sig);
    }

    #[tokio::test]
    async fn test_engine_refuses_foreign_account() {
        let engine = engine(Arc::new(MockTransport::new()), Duration::ZERO);
        let err = engine
            .request(
                "personal_sign",
                json!(["0x00", "0x0000000000000000000000000000000000000001"]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcError::UNAUTHORIZED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_caches_block_scoped_reads_while_polling() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("eth_getBalance", json!("0x64"));
        transport.respond("eth_blockNumber", json!("0x10"));
        let engine = engine(Arc::clone(&transport), Duration::from_secs(3600));
        let mut events = engine.subscribe();
        engine.start();
        assert_eq!(events.next().await, Some(ProviderEvent::Block(16)));

        let params = json!([TEST_ADDRESS, "latest"]);
        let before = transport.calls.load(Ordering::SeqCst);
        assert_eq!(
            engine.request("eth_getBalance", params.clone()).await.unwrap(),
            json!("0x64")
        );
        assert_eq!(
            engine.request("eth_getBalance", params).await.unwrap(),
            json!("0x64")
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), before + 1);
    }

    #[tokio::test]
    async fn test_block_scoped_reads_bypass_cache_without_polling() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("eth_getBalance", json!("0x64"));
        transport.respond("eth_chainId", json!("0x1"));
        let engine = engine(Arc::clone(&transport), Duration::ZERO);
        engine.start();
        assert!(!engine.is_running());

        let params = json!([TEST_ADDRESS, "latest"]);
        engine.request("eth_getBalance", params.clone()).await.unwrap();
        transport.respond("eth_getBalance", json!("0x65"));
        assert_eq!(
            engine.request("eth_getBalance", params).await.unwrap(),
            json!("0x65")
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_engine_refuses_every_request() {
        let transport = Arc::new(MockTransport::new());
        let engine = Arc::new(engine(Arc::clone(&transport), Duration::ZERO));
        let provider: Arc<dyn Eip1193> = engine.clone();
        assert!(provider.request("eth_accounts", json!([])).await.is_ok());

        engine.close();
        engine.close();
        assert!(engine.is_closed());

        for (method, params) in [
            ("eth_accounts", json!([])),
            ("personal_sign", json!(["0x68656c6c6f", TEST_ADDRESS])),
            ("eth_getBalance", json!([TEST_ADDRESS, "latest"])),
        ] {
            let err = provider.request(method, params).await.unwrap_err();
            assert_eq!(err.code, RpcError::DISCONNECTED, "{method}");
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_emits_new_blocks() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("eth_blockNumber", json!("0x10"));
        let engine = engine(Arc::clone(&transport), Duration::from_millis(100));
        let mut events = engine.subscribe();

        engine.start();
        engine.start();
        assert!(engine.is_running());
        assert_eq!(events.next().await, Some(ProviderEvent::Block(16)));

        transport.respond("eth_blockNumber", json!("0x11"));
        assert_eq!(events.next().await, Some(ProviderEvent::Block(17)));

        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
    }
}
