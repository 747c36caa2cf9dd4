//! Configuration types for connectors and the coordinator.
//!
//! All types deserialize from JSON with camelCase keys, so connector setups can
//! live in a config file:
//!
//! ```json
//! { "chainId": 1, "url": "https://rpc.example", "pollingIntervalMs": 12000 }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ChainId;
use crate::error::{ActivationError, Result};
use crate::secret::DEFAULT_DERIVATION_PATH;

/// Default block polling interval.
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 12_000;

const fn default_polling_interval_ms() -> u64 {
    DEFAULT_POLLING_INTERVAL_MS
}

const fn default_true() -> bool {
    true
}

fn default_derivation_path() -> String {
    DEFAULT_DERIVATION_PATH.to_owned()
}

/// Check `chain_id` against an optional allow-list.
pub fn ensure_chain_supported(chain_id: ChainId, supported: Option<&[ChainId]>) -> Result<()> {
    match supported {
        Some(ids) if !ids.contains(&chain_id) => {
            Err(ActivationError::unsupported_chain(chain_id, ids))
        }
        _ => Ok(()),
    }
}

/// Configuration shared by connectors that talk to a fixed RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfig {
    /// Chain the connector serves.
    pub chain_id: ChainId,
    /// JSON-RPC endpoint for read calls.
    pub url: String,
    /// Block polling interval in milliseconds. Zero disables polling.
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    /// Per-request timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    /// Chains this connector accepts. Defaults to `[chain_id]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_chain_ids: Option<Vec<ChainId>>,
}

impl ConnectorConfig {
    /// Create a config for `chain_id` served by `url`.
    #[must_use]
    pub fn new(chain_id: ChainId, url: impl Into<String>) -> Self {
        Self {
            chain_id,
            url: url.into(),
            polling_interval_ms: DEFAULT_POLLING_INTERVAL_MS,
            request_timeout_ms: None,
            supported_chain_ids: None,
        }
    }

    /// Set the block polling interval.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the per-request timeout.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Restrict the accepted chains.
    #[must_use]
    pub fn with_supported_chain_ids(mut self, ids: impl IntoIterator<Item = ChainId>) -> Self {
        self.supported_chain_ids = Some(ids.into_iter().collect());
        self
    }

    /// Block polling interval.
    #[must_use]
    pub const fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Per-request timeout, if any.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Accepted chains: the explicit list, or just the configured chain.
    #[must_use]
    pub fn supported_chains(&self) -> Vec<ChainId> {
        self.supported_chain_ids
            .clone()
            .unwrap_or_else(|| vec![self.chain_id])
    }

    /// Fail with [`ActivationError::UnsupportedChain`] if the configured chain is not accepted.
    pub fn ensure_supported(&self) -> Result<()> {
        ensure_chain_supported(self.chain_id, Some(&self.supported_chains()))
    }
}

/// Hardware wallet family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Ledger over WebUSB/HID.
    #[default]
    Ledger,
    /// Trezor via Trezor Connect. Requires a [`DeviceManifest`].
    Trezor,
}

/// Application identity shown by Trezor Connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceManifest {
    /// Contact email.
    pub email: String,
    /// Application URL.
    pub app_url: String,
}

/// Hardware connector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareConfig {
    /// Chain and RPC settings.
    #[serde(flatten)]
    pub connector: ConnectorConfig,
    /// Device family.
    #[serde(default)]
    pub device: DeviceKind,
    /// Path of the single exposed account.
    #[serde(default = "default_derivation_path")]
    pub derivation_path: String,
    /// Trezor manifest metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<DeviceManifest>,
}

impl HardwareConfig {
    /// Ledger on the given chain and endpoint.
    #[must_use]
    pub fn ledger(connector: ConnectorConfig) -> Self {
        Self {
            connector,
            device: DeviceKind::Ledger,
            derivation_path: default_derivation_path(),
            manifest: None,
        }
    }

    /// Trezor on the given chain and endpoint.
    #[must_use]
    pub fn trezor(connector: ConnectorConfig, manifest: DeviceManifest) -> Self {
        Self {
            connector,
            device: DeviceKind::Trezor,
            derivation_path: default_derivation_path(),
            manifest: Some(manifest),
        }
    }

    /// Override the derivation path.
    #[must_use]
    pub fn with_derivation_path(mut self, path: impl Into<String>) -> Self {
        self.derivation_path = path.into();
        self
    }
}

/// Remote (QR-paired) session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSessionConfig {
    /// RPC endpoint per supported chain.
    pub rpc: BTreeMap<ChainId, String>,
    /// Chain requested when pairing. Defaults to the lowest configured chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<ChainId>,
    /// Block polling interval in milliseconds.
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    /// Publish the pairing URI for display as a QR code.
    #[serde(default = "default_true")]
    pub qrcode: bool,
}

impl RemoteSessionConfig {
    /// Create a config from `(chain, url)` pairs.
    #[must_use]
    pub fn new(rpc: impl IntoIterator<Item = (ChainId, String)>) -> Self {
        Self {
            rpc: rpc.into_iter().collect(),
            chain_id: None,
            polling_interval_ms: DEFAULT_POLLING_INTERVAL_MS,
            qrcode: true,
        }
    }

    /// Chains with a configured endpoint.
    #[must_use]
    pub fn supported_chains(&self) -> Vec<ChainId> {
        self.rpc.keys().copied().collect()
    }

    /// Chain to request when pairing.
    #[must_use]
    pub fn preferred_chain(&self) -> Option<ChainId> {
        self.chain_id.or_else(|| self.rpc.keys().next().copied())
    }
}

/// Coordinator-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorConfig {
    /// Chains the application accepts. `None` accepts any chain.
    #[serde(default)]
    pub supported_chain_ids: Option<Vec<ChainId>>,
    /// Deactivate the previous connector when a different one is installed.
    #[serde(default)]
    pub deactivate_replaced: bool,
}

impl CoordinatorConfig {
    /// Accept only the given chains.
    #[must_use]
    pub fn with_supported_chain_ids(mut self, ids: impl IntoIterator<Item = ChainId>) -> Self {
        self.supported_chain_ids = Some(ids.into_iter().collect());
        self
    }

    /// Deactivate replaced connectors on switch.
    #[must_use]
    pub const fn with_deactivate_replaced(mut self, enabled: bool) -> Self {
        self.deactivate_replaced = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_connector_config_defaults() {
        let config = ConnectorConfig::new(1, "http://localhost:8545");
        assert_eq!(config.polling_interval(), Duration::from_secs(12));
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.supported_chains(), vec![1]);
        assert!(config.ensure_supported().is_ok());
    }

    #[test]
    fn test_connector_config_from_json() {
        let config: ConnectorConfig = serde_json::from_value(json!({
            "chainId": 4,
            "url": "https://rinkeby.example",
            "pollingIntervalMs": 4000,
            "supportedChainIds": [1, 3]
        }))
        .unwrap();
        assert_eq!(config.polling_interval(), Duration::from_secs(4));
        assert_eq!(
            config.ensure_supported(),
            Err(ActivationError::unsupported_chain(4, &[1, 3]))
        );
    }

    #[test]
    fn test_hardware_config_from_json() {
        let config: HardwareConfig = serde_json::from_value(json!({
            "chainId": 1,
            "url": "https://mainnet.example",
            "device": "trezor",
            "manifest": {"email": "dev@example.com", "appUrl": "http://localhost:1234"}
        }))
        .unwrap();
        assert_eq!(config.device, DeviceKind::Trezor);
        assert_eq!(config.derivation_path, "m/44'/60'/0'/0/0");
        assert_eq!(config.connector.polling_interval_ms, DEFAULT_POLLING_INTERVAL_MS);
    }

    #[test]
    fn test_remote_session_config_chains() {
        let config: RemoteSessionConfig = serde_json::from_value(json!({
            "rpc": {"4": "https://rinkeby.example", "1": "https://mainnet.example"}
        }))
        .unwrap();
        assert_eq!(config.supported_chains(), vec![1, 4]);
        assert_eq!(config.preferred_chain(), Some(1));
        assert!(config.qrcode);
    }

    #[test]
    fn test_ensure_chain_supported() {
        assert!(ensure_chain_supported(1, None).is_ok());
        assert!(ensure_chain_supported(1, Some(&[1, 3, 4, 5, 42])).is_ok());
        assert!(ensure_chain_supported(56, Some(&[1, 3, 4, 5, 42])).is_err());
    }
}
