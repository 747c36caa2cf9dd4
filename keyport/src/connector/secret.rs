//! Connector backed by secret material held in memory.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use alloy::primitives::Address;
use async_trait::async_trait;
use tracing::{debug, info};

use super::{Activation, Connector, ConnectorKind, Install, SessionSlot, cancelled, connect_rpc, not_active};
use crate::ChainId;
use crate::config::ConnectorConfig;
use crate::error::{ActivationError, Result};
use crate::provider::{LocalKeySigner, ProviderEngine, RpcTransport, SharedProvider};
use crate::secret::{PrivateKey, keystore_to_private_key_str, mnemonic_to_private_key};

#[derive(Debug, Clone)]
struct RawSession {
    engine: Arc<ProviderEngine>,
    account: Address,
}

impl RawSession {
    fn activation(&self) -> Activation {
        let engine = Arc::clone(&self.engine);
        let chain_id = engine.chain_id();
        let provider: SharedProvider = engine;
        Activation { provider, chain_id }
    }
}

/// Connector for a private key, a mnemonic or a keystore file.
///
/// Never prompts, so activation cannot fail with
/// [`ActivationError::UserRejected`]. The key is dropped (and zeroized) on
/// [`deactivate`](Connector::deactivate), together with the engine's signer,
/// so provider handles obtained earlier can no longer sign. A deactivated
/// instance cannot be activated again.
pub struct RawSecretConnector {
    config: ConnectorConfig,
    address: Option<Address>,
    key: Mutex<Option<PrivateKey>>,
    rpc: Option<Arc<dyn RpcTransport>>,
    slot: SessionSlot<RawSession>,
}

impl fmt::Debug for RawSecretConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSecretConnector")
            .field("config", &self.config)
            .field("address", &self.address)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl RawSecretConnector {
    /// Create a connector for an already resolved key.
    #[must_use]
    pub fn new(config: ConnectorConfig, key: PrivateKey) -> Self {
        Self {
            address: key.address(),
            config,
            key: Mutex::new(Some(key)),
            rpc: None,
            slot: SessionSlot::new(),
        }
    }

    /// Create a connector for a hex private key, with or without `0x`.
    pub fn from_private_key(config: ConnectorConfig, key: &str) -> Result<Self> {
        Ok(Self::new(config, PrivateKey::from_hex(key)?))
    }

    /// Create a connector for the first account of a BIP-39 mnemonic.
    pub fn from_mnemonic(
        config: ConnectorConfig,
        phrase: &str,
        passphrase: Option<&str>,
    ) -> Result<Self> {
        Ok(Self::new(config, mnemonic_to_private_key(phrase, passphrase)?))
    }

    /// Create a connector for an encrypted keystore file.
    pub fn from_keystore(config: ConnectorConfig, keystore: &str, password: &str) -> Result<Self> {
        Ok(Self::new(config, keystore_to_private_key_str(keystore, password)?))
    }

    /// Use `rpc` for read calls instead of connecting to the configured URL.
    #[must_use]
    pub fn with_rpc_transport(mut self, rpc: Arc<dyn RpcTransport>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    /// Connector configuration.
    #[must_use]
    pub const fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Address controlled by the key, known without activating.
    #[must_use]
    pub const fn address(&self) -> Option<Address> {
        self.address
    }

    fn current(&self) -> Result<RawSession> {
        self.slot
            .current()
            .ok_or_else(|| not_active(ConnectorKind::RawSecret))
    }

    fn signer(&self) -> Result<LocalKeySigner> {
        let key = self.key.lock().unwrap_or_else(PoisonError::into_inner);
        let key = key
            .as_ref()
            .ok_or_else(|| ActivationError::invalid_secret("secret material was released"))?;
        LocalKeySigner::from_hex(key.as_hex(), self.config.chain_id)
    }

    async fn open_session(&self) -> Result<RawSession> {
        self.config.ensure_supported()?;
        let signer = self.signer()?;
        let account = signer.address();
        let rpc = match &self.rpc {
            Some(rpc) => Arc::clone(rpc),
            None => connect_rpc(&self.config.url, self.config.request_timeout()).await?,
        };
        let engine = Arc::new(ProviderEngine::new(
            self.config.chain_id,
            Arc::new(signer),
            rpc,
            self.config.polling_interval(),
        ));
        engine.start();
        Ok(RawSession { engine, account })
    }
}

#[async_trait]
impl Connector for RawSecretConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::RawSecret
    }

    async fn activate(&self) -> Result<Activation> {
        if let Some(session) = self.slot.current() {
            return Ok(session.activation());
        }

        let epoch = self.slot.epoch();
        let session = self.open_session().await?;
        let session = match self.slot.install(epoch, session) {
            Install::Installed(session) => session,
            Install::Existing { existing, discarded } => {
                discarded.engine.close();
                existing
            }
            Install::Cancelled(session) => {
                session.engine.close();
                return Err(cancelled(ConnectorKind::RawSecret));
            }
        };
        info!(
            chain_id = self.config.chain_id,
            account = %session.account,
            "local signer ready"
        );
        Ok(session.activation())
    }

    async fn account(&self) -> Result<Address> {
        Ok(self.current()?.account)
    }

    async fn chain_id(&self) -> Result<ChainId> {
        Ok(self.current()?.engine.chain_id())
    }

    async fn provider(&self) -> Result<SharedProvider> {
        Ok(self.current()?.activation().provider)
    }

    async fn deactivate(&self) {
        let released = self
            .key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if let Some(session) = self.slot.take() {
            session.engine.close();
        }
        if released {
            debug!("raw secret connector deactivated, key released");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::error::RpcError;
    use crate::test_support::{MockTransport, TEST_ADDRESS, TEST_MNEMONIC, TEST_PRIVATE_KEY};

    fn config() -> ConnectorConfig {
        ConnectorConfig::new(4, "http://localhost:8545").with_polling_interval(Duration::ZERO)
    }

    fn connector(key: &str) -> RawSecretConnector {
        RawSecretConnector::from_private_key(config(), key)
            .unwrap()
            .with_rpc_transport(Arc::new(MockTransport::new()))
    }

    #[tokio::test]
    async fn test_private_key_activation() {
        let connector = connector(TEST_PRIVATE_KEY);
        let activation = connector.activate().await.unwrap();
        assert_eq!(activation.chain_id, 4);
        assert_eq!(
            connector.account().await.unwrap(),
            TEST_ADDRESS.parse::<Address>().unwrap()
        );
        assert_eq!(
            activation.provider.request("eth_chainId", json!([])).await.unwrap(),
            json!("0x4")
        );

        let again = connector.activate().await.unwrap();
        assert!(Arc::ptr_eq(&activation.provider, &again.provider));
    }

    #[test]
    fn test_mnemonic_and_key_agree() {
        let from_mnemonic = RawSecretConnector::from_mnemonic(config(), TEST_MNEMONIC, None).unwrap();
        let from_key = connector(&format!("0x{TEST_PRIVATE_KEY}"));
        assert_eq!(from_mnemonic.address(), from_key.address());
    }

    #[test]
    fn test_invalid_material() {
        assert!(matches!(
            RawSecretConnector::from_private_key(config(), "0x1234"),
            Err(ActivationError::InvalidSecretMaterial(_))
        ));
        assert!(matches!(
            RawSecretConnector::from_keystore(config(), r#"{"foo": 1}"#, "pw"),
            Err(ActivationError::InvalidSecretMaterial(_))
        ));
    }

    #[tokio::test]
    async fn test_deactivate_releases_key() {
        let connector = connector(TEST_PRIVATE_KEY);
        let activation = connector.activate().await.unwrap();

        connector.deactivate().await;
        connector.deactivate().await;
        assert!(connector.provider().await.is_err());
        assert!(matches!(
            connector.activate().await.unwrap_err(),
            ActivationError::InvalidSecretMaterial(_)
        ));

        for (method, params) in [
            ("eth_accounts", json!([])),
            ("personal_sign", json!(["0x68656c6c6f", TEST_ADDRESS])),
        ] {
            let err = activation.provider.request(method, params).await.unwrap_err();
            assert_eq!(err.code, RpcError::DISCONNECTED, "{method}");
        }
    }

    #[tokio::test]
    async fn test_configured_chain_must_be_supported() {
        let connector = RawSecretConnector::from_private_key(
            config().with_supported_chain_ids([1]),
            TEST_PRIVATE_KEY,
        )
        .unwrap()
        .with_rpc_transport(Arc::new(MockTransport::new()));
        assert_eq!(
            connector.activate().await.unwrap_err(),
            ActivationError::unsupported_chain(4, &[1])
        );
    }
}
