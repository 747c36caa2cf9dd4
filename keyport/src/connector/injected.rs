//! Connector for a provider injected by the host environment.

use std::fmt;
use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{Activation, Connector, ConnectorKind, Install, SessionSlot, cancelled, not_active};
use crate::ChainId;
use crate::config::ensure_chain_supported;
use crate::error::{ActivationError, Result};
use crate::provider::{SharedProvider, parse_accounts, parse_chain_id};

/// Looks up the injected provider, if the host has one.
pub trait ProviderDetector: Send + Sync {
    /// The injected provider, or `None` if the host has none.
    fn detect(&self) -> Option<SharedProvider>;
}

impl<F> ProviderDetector for F
where
    F: Fn() -> Option<SharedProvider> + Send + Sync,
{
    fn detect(&self) -> Option<SharedProvider> {
        self()
    }
}

/// Connector for a host-injected EIP-1193 provider.
///
/// Activation asks the user to expose accounts (`eth_requestAccounts`).
/// Once granted, later activations only refresh the chain id and never
/// prompt again.
pub struct InjectedConnector {
    detector: Box<dyn ProviderDetector>,
    supported_chain_ids: Option<Vec<ChainId>>,
    slot: SessionSlot<SharedProvider>,
}

impl fmt::Debug for InjectedConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectedConnector")
            .field("supported_chain_ids", &self.supported_chain_ids)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl InjectedConnector {
    /// Create a connector that looks the provider up through `detector`.
    pub fn new(detector: impl ProviderDetector + 'static) -> Self {
        Self {
            detector: Box::new(detector),
            supported_chain_ids: None,
            slot: SessionSlot::new(),
        }
    }

    /// Create a connector for a provider that is known to be present.
    #[must_use]
    pub fn with_provider(provider: SharedProvider) -> Self {
        Self::new(move || Some(Arc::clone(&provider)))
    }

    /// Restrict the accepted chains.
    #[must_use]
    pub fn supported_chain_ids(mut self, ids: impl IntoIterator<Item = ChainId>) -> Self {
        self.supported_chain_ids = Some(ids.into_iter().collect());
        self
    }

    /// The injected provider, whether or not the connector is active.
    #[must_use]
    pub fn detect(&self) -> Option<SharedProvider> {
        self.detector.detect()
    }

    /// Returns `true` if the host already exposes accounts to this application.
    ///
    /// Uses `eth_accounts`, which never prompts.
    pub async fn is_authorized(&self) -> bool {
        let Some(provider) = self.detector.detect() else {
            return false;
        };
        let accounts = provider
            .request("eth_accounts", json!([]))
            .await
            .and_then(|value| parse_accounts(&value));
        match accounts {
            Ok(accounts) => !accounts.is_empty(),
            Err(e) => {
                debug!(error = %e, "authorization check failed");
                false
            }
        }
    }

    fn current(&self) -> Result<SharedProvider> {
        self.slot
            .current()
            .ok_or_else(|| not_active(ConnectorKind::Injected))
    }

    fn ensure_supported(&self, chain_id: ChainId) -> Result<()> {
        ensure_chain_supported(chain_id, self.supported_chain_ids.as_deref())
    }

    async fn request_accounts(provider: &SharedProvider) -> Result<Vec<Address>> {
        let value = match provider.request("eth_requestAccounts", json!([])).await {
            Ok(value) => value,
            Err(e) if e.is_user_rejected() => {
                info!("user rejected account access");
                return Err(ActivationError::UserRejected);
            }
            Err(e) => {
                warn!(error = %e, "eth_requestAccounts failed, falling back to eth_enable");
                provider.request("eth_enable", json!([])).await?
            }
        };
        let accounts = parse_accounts(&value)?;
        if accounts.is_empty() {
            return Err(ActivationError::unknown("provider exposed no accounts"));
        }
        Ok(accounts)
    }
}

async fn read_chain_id(provider: &SharedProvider) -> Result<ChainId> {
    let value = provider.request("eth_chainId", json!([])).await?;
    Ok(parse_chain_id(&value)?)
}

#[async_trait]
impl Connector for InjectedConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Injected
    }

    async fn activate(&self) -> Result<Activation> {
        if let Some(provider) = self.slot.current() {
            let chain_id = read_chain_id(&provider).await?;
            self.ensure_supported(chain_id)?;
            debug!(chain_id, "injected session refreshed");
            return Ok(Activation { provider, chain_id });
        }

        let epoch = self.slot.epoch();
        let provider = self.detector.detect().ok_or(ActivationError::NoProviderFound)?;
        let accounts = Self::request_accounts(&provider).await?;
        let chain_id = read_chain_id(&provider).await?;
        self.ensure_supported(chain_id)?;

        let provider = match self.slot.install(epoch, provider) {
            Install::Installed(provider) | Install::Existing { existing: provider, .. } => provider,
            Install::Cancelled(_) => return Err(cancelled(ConnectorKind::Injected)),
        };
        info!(chain_id, account = %accounts[0], "injected provider connected");
        Ok(Activation { provider, chain_id })
    }

    async fn account(&self) -> Result<Address> {
        let provider = self.current()?;
        let value = provider.request("eth_accounts", json!([])).await?;
        parse_accounts(&value)?
            .first()
            .copied()
            .ok_or_else(|| ActivationError::unknown("provider exposed no accounts"))
    }

    async fn chain_id(&self) -> Result<ChainId> {
        let provider = self.current()?;
        read_chain_id(&provider).await
    }

    async fn provider(&self) -> Result<SharedProvider> {
        self.current()
    }

    async fn deactivate(&self) {
        if self.slot.take().is_some() {
            debug!("injected connector deactivated");
        }
    }
}
