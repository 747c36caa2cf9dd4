//! Connector for a hardware wallet.
//!
//! The device signs; everything else goes through a [`ProviderEngine`] bound
//! to the configured chain. Exactly one account is exposed, at the configured
//! derivation path.

use std::fmt;
use std::sync::Arc;

use alloy::primitives::{Address, Bytes};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{Activation, Connector, ConnectorKind, Install, SessionSlot, cancelled, connect_rpc, not_active};
use crate::ChainId;
use crate::config::{DeviceKind, HardwareConfig};
use crate::error::{ActivationError, Result, RpcError};
use crate::provider::{AccountSigner, ProviderEngine, RpcTransport, SharedProvider};

/// Failure reported by a hardware transport or device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DeviceError {
    /// The transport could not be opened, or the device stopped answering.
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// The user declined on the device.
    #[error("request rejected on device")]
    Rejected,

    /// Any other device failure.
    #[error("device error: {0}")]
    Other(String),
}

impl From<DeviceError> for ActivationError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Unreachable(msg) => Self::DeviceUnreachable(msg),
            DeviceError::Rejected => Self::UserRejected,
            DeviceError::Other(msg) => Self::Unknown(msg),
        }
    }
}

impl From<DeviceError> for RpcError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Rejected => Self::user_rejected(),
            other => Self::internal(other.to_string()),
        }
    }
}

/// Opens a session with a hardware device.
#[async_trait]
pub trait HardwareTransport: Send + Sync + fmt::Debug {
    /// Open the device.
    async fn open(&self, kind: DeviceKind) -> Result<Arc<dyn HardwareDevice>, DeviceError>;
}

/// An open hardware device.
#[async_trait]
pub trait HardwareDevice: Send + Sync + fmt::Debug {
    /// Address at `path`.
    async fn address(&self, path: &str) -> Result<Address, DeviceError>;

    /// EIP-191 personal signature with the key at `path`, as 65 raw bytes.
    async fn sign_personal_message(&self, path: &str, message: &[u8]) -> Result<Bytes, DeviceError>;

    /// Release the transport.
    async fn close(&self);
}

/// [`AccountSigner`] that delegates to a hardware device.
#[derive(Debug)]
pub struct DeviceSigner {
    device: Arc<dyn HardwareDevice>,
    path: String,
    address: Address,
}

impl DeviceSigner {
    /// Read the address at `path` and bind a signer to it.
    pub async fn open(device: Arc<dyn HardwareDevice>, path: &str) -> Result<Self, DeviceError> {
        let address = device.address(path).await?;
        Ok(Self {
            device,
            path: path.to_owned(),
            address,
        })
    }

    /// The exposed account.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }
}

#[async_trait]
impl AccountSigner for DeviceSigner {
    async fn accounts(&self) -> Result<Vec<Address>, RpcError> {
        Ok(vec![self.address])
    }

    async fn sign_message(&self, account: Address, message: &[u8]) -> Result<Bytes, RpcError> {
        if account != self.address {
            return Err(RpcError::new(
                RpcError::UNAUTHORIZED,
                format!("account {account} is not on this device"),
            ));
        }
        Ok(self.device.sign_personal_message(&self.path, message).await?)
    }
}

#[derive(Debug, Clone)]
struct HardwareSession {
    engine: Arc<ProviderEngine>,
    device: Arc<dyn HardwareDevice>,
    account: Address,
}

impl HardwareSession {
    fn activation(&self) -> Activation {
        let engine = Arc::clone(&self.engine);
        let chain_id = engine.chain_id();
        let provider: SharedProvider = engine;
        Activation { provider, chain_id }
    }

    async fn shutdown(&self) {
        self.engine.close();
        self.device.close().await;
    }
}

/// Connector for a Ledger or Trezor device.
#[derive(Debug)]
pub struct HardwareConnector {
    config: HardwareConfig,
    transport: Arc<dyn HardwareTransport>,
    rpc: Option<Arc<dyn RpcTransport>>,
    slot: SessionSlot<HardwareSession>,
}

impl HardwareConnector {
    /// Create a connector that opens devices through `transport`.
    #[must_use]
    pub fn new(config: HardwareConfig, transport: Arc<dyn HardwareTransport>) -> Self {
        Self {
            config,
            transport,
            rpc: None,
            slot: SessionSlot::new(),
        }
    }

    /// Use `rpc` for read calls instead of connecting to the configured URL.
    #[must_use]
    pub fn with_rpc_transport(mut self, rpc: Arc<dyn RpcTransport>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    /// Connector configuration.
    #[must_use]
    pub const fn config(&self) -> &HardwareConfig {
        &self.config
    }

    fn current(&self) -> Result<HardwareSession> {
        self.slot
            .current()
            .ok_or_else(|| not_active(ConnectorKind::Hardware))
    }

    async fn open_session(&self) -> Result<HardwareSession> {
        let connector = &self.config.connector;
        connector.ensure_supported()?;
        if self.config.device == DeviceKind::Trezor && self.config.manifest.is_none() {
            return Err(ActivationError::unknown("trezor connector requires a manifest"));
        }

        let rpc = match &self.rpc {
            Some(rpc) => Arc::clone(rpc),
            None => connect_rpc(&connector.url, connector.request_timeout()).await?,
        };

        let device = self.transport.open(self.config.device).await.map_err(|e| match e {
            DeviceError::Rejected => ActivationError::UserRejected,
            other => ActivationError::device_unreachable(other.to_string()),
        })?;
        let signer = match DeviceSigner::open(Arc::clone(&device), &self.config.derivation_path).await {
            Ok(signer) => signer,
            Err(e) => {
                device.close().await;
                return Err(e.into());
            }
        };
        let account = signer.address();

        let engine = Arc::new(ProviderEngine::new(
            connector.chain_id,
            Arc::new(signer),
            rpc,
            connector.polling_interval(),
        ));
        engine.start();
        Ok(HardwareSession {
            engine,
            device,
            account,
        })
    }
}

#[async_trait]
impl Connector for HardwareConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Hardware
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
                session.shutdown().await;
                return Err(cancelled(ConnectorKind::Hardware));
            }
        };
        info!(
            device = ?self.config.device,
            chain_id = self.config.connector.chain_id,
            account = %session.account,
            "hardware wallet connected"
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
        if let Some(session) = self.slot.take() {
            session.shutdown().await;
            debug!("hardware connector deactivated");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;
    use crate::config::{ConnectorConfig, DeviceManifest};
    use crate::test_support::{MockDevice, MockTransport, TEST_ADDRESS};

    fn connector(device: &Arc<MockDevice>, config: ConnectorConfig) -> HardwareConnector {
        HardwareConnector::new(HardwareConfig::ledger(config), Arc::clone(device) as _)
            .with_rpc_transport(Arc::new(MockTransport::new()))
    }

    fn mainnet() -> ConnectorConfig {
        ConnectorConfig::new(1, "http://localhost:8545").with_polling_interval(std::time::Duration::ZERO)
    }

    #[tokio::test]
    async fn test_activate_exposes_single_device_account() {
        let device = Arc::new(MockDevice::new(TEST_ADDRESS));
        let connector = connector(&device, mainnet());

        let activation = connector.activate().await.unwrap();
        assert_eq!(activation.chain_id, 1);
        assert_eq!(
            activation.provider.request("eth_accounts", json!([])).await.unwrap(),
            json!([TEST_ADDRESS])
        );
        assert_eq!(
            connector.account().await.unwrap(),
            TEST_ADDRESS.parse::<Address>().unwrap()
        );

        connector.activate().await.unwrap();
        assert_eq!(device.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_signing_goes_through_device() {
        let device = Arc::new(MockDevice::new(TEST_ADDRESS));
        let connector = connector(&device, mainnet());
        let activation = connector.activate().await.unwrap();

        let sig = activation
            .provider
            .request("personal_sign", json!(["0x68656c6c6f", TEST_ADDRESS]))
            .await
            .unwrap();
        assert_eq!(sig.as_str().unwrap().len(), 2 + 130);
        assert_eq!(device.signed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_device() {
        let device = Arc::new(MockDevice::new(TEST_ADDRESS));
        device.unplug();
        let connector = connector(&device, mainnet());
        assert!(matches!(
            connector.activate().await.unwrap_err(),
            ActivationError::DeviceUnreachable(_)
        ));
    }

    #[tokio::test]
    async fn test_rejection_on_device_closes_transport() {
        let device = Arc::new(MockDevice::new(TEST_ADDRESS));
        device.reject_requests();
        let connector = connector(&device, mainnet());

        assert!(connector.activate().await.unwrap_err().is_user_rejected());
        assert_eq!(device.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chain_outside_supported_set() {
        let device = Arc::new(MockDevice::new(TEST_ADDRESS));
        let connector = connector(&device, mainnet().with_supported_chain_ids([3, 4]));
        assert!(connector.activate().await.unwrap_err().is_unsupported_chain());
        assert_eq!(device.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_trezor_requires_manifest() {
        let device = Arc::new(MockDevice::new(TEST_ADDRESS));
        let mut config = HardwareConfig::trezor(
            mainnet(),
            DeviceManifest {
                email: "dev@example.com".to_owned(),
                app_url: "http://localhost:1234".to_owned(),
            },
        );
        config.manifest = None;
        let connector = HardwareConnector::new(config, Arc::clone(&device) as _)
            .with_rpc_transport(Arc::new(MockTransport::new()));
        assert!(matches!(
            connector.activate().await.unwrap_err(),
            ActivationError::Unknown(_)
        ));
    }

    #[tokio::test]
    async fn test_deactivate_releases_device() {
        let device = Arc::new(MockDevice::new(TEST_ADDRESS));
        let connector = connector(&device, mainnet());
        let activation = connector.activate().await.unwrap();

        connector.deactivate().await;
        connector.deactivate().await;
        assert_eq!(device.closed.load(Ordering::SeqCst), 1);
        assert!(connector.account().await.is_err());

        let err = activation
            .provider
            .request("personal_sign", json!(["0x68656c6c6f", TEST_ADDRESS]))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcError::DISCONNECTED);
        assert_eq!(device.signed.load(Ordering::SeqCst), 0);
    }
}
