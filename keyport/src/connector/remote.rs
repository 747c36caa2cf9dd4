//! Connector for a remote wallet paired through a relay session.
//!
//! Pairing publishes a URI (rendered as a QR code by the application) and
//! then waits for the remote wallet to approve. The relay protocol itself is
//! behind [`SessionClient`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use alloy::primitives::Address;
use async_trait::async_trait;
use futures::{StreamExt, future, stream};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{Activation, Connector, ConnectorKind, Install, SessionSlot, cancelled, not_active};
use crate::ChainId;
use crate::config::{RemoteSessionConfig, ensure_chain_supported};
use crate::error::{ActivationError, Result, RpcError};
use crate::provider::{
    Eip1193, EventBus, EventStream, ProviderEvent, SharedProvider, parse_accounts, parse_chain_id,
};

/// What the remote wallet agreed to when approving a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionApproval {
    /// Exposed accounts, primary first.
    pub accounts: Vec<Address>,
    /// Chain the wallet is on.
    pub chain_id: ChainId,
}

/// Relay session protocol client.
#[async_trait]
pub trait SessionClient: Send + Sync + fmt::Debug {
    /// Create a pairing request for `chain_id` and return its URI.
    async fn pair(&self, chain_id: ChainId) -> Result<String, RpcError>;

    /// Wait until the remote wallet approves or rejects the pairing.
    async fn approval(&self) -> Result<SessionApproval, RpcError>;

    /// Provider bound to the approved session.
    fn provider(&self) -> SharedProvider;

    /// Kill the session on the relay.
    async fn disconnect(&self) -> Result<(), RpcError>;
}

/// Provider wrapper that owns the close-detection flag of one session.
///
/// Once the session is closed from this side, the protocol's own
/// `Disconnect` notification is dropped so the application only sees
/// [`ProviderEvent::SessionClosed`].
struct SessionProvider {
    inner: SharedProvider,
    closed: Arc<AtomicBool>,
    local: EventBus,
}

impl fmt::Debug for SessionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionProvider")
            .field("inner", &self.inner)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SessionProvider {
    fn new(inner: SharedProvider) -> Self {
        Self {
            inner,
            closed: Arc::new(AtomicBool::new(false)),
            local: EventBus::new(),
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Eip1193 for SessionProvider {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::disconnected());
        }
        self.inner.request(method, params).await
    }

    fn subscribe(&self) -> EventStream {
        let closed = Arc::clone(&self.closed);
        let remote = self.inner.subscribe().filter(move |event| {
            let suppressed =
                matches!(event, ProviderEvent::Disconnect) && closed.load(Ordering::SeqCst);
            future::ready(!suppressed)
        });
        stream::select(remote, self.local.subscribe()).boxed()
    }
}

/// Connector for a QR-paired remote wallet.
pub struct RemoteSessionConnector {
    config: RemoteSessionConfig,
    client: Arc<dyn SessionClient>,
    pairing: watch::Sender<Option<String>>,
    slot: SessionSlot<Arc<SessionProvider>>,
}

impl fmt::Debug for RemoteSessionConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSessionConnector")
            .field("config", &self.config)
            .field("client", &self.client)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl RemoteSessionConnector {
    /// Create a connector over a relay client.
    #[must_use]
    pub fn new(config: RemoteSessionConfig, client: Arc<dyn SessionClient>) -> Self {
        let (pairing, _) = watch::channel(None);
        Self {
            config,
            client,
            pairing,
            slot: SessionSlot::new(),
        }
    }

    /// Connector configuration.
    #[must_use]
    pub const fn config(&self) -> &RemoteSessionConfig {
        &self.config
    }

    /// Watch the pending pairing URI. `None` when no pairing is waiting.
    #[must_use]
    pub fn pairing_uri(&self) -> watch::Receiver<Option<String>> {
        self.pairing.subscribe()
    }

    /// Close the session from this side.
    ///
    /// Subscribers receive exactly one [`ProviderEvent::SessionClosed`]; the
    /// `Disconnect` the relay reports in response is suppressed.
    pub async fn close(&self) {
        let Some(session) = self.slot.take() else {
            return;
        };
        self.teardown(&session).await;
        session.local.emit(ProviderEvent::SessionClosed);
        info!("remote session closed");
    }

    async fn teardown(&self, session: &SessionProvider) {
        session.mark_closed();
        self.pairing.send_replace(None);
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "failed to kill remote session");
        }
    }

    fn current(&self) -> Result<Arc<SessionProvider>> {
        self.slot
            .current()
            .ok_or_else(|| not_active(ConnectorKind::RemoteSession))
    }

    fn ensure_supported(&self, chain_id: ChainId) -> Result<()> {
        ensure_chain_supported(chain_id, Some(&self.config.supported_chains()))
    }

    async fn pair(&self) -> Result<SessionApproval> {
        let chain_id = self
            .config
            .preferred_chain()
            .ok_or_else(|| ActivationError::unknown("no RPC endpoints configured"))?;
        let uri = self.client.pair(chain_id).await?;
        if self.config.qrcode {
            self.pairing.send_replace(Some(uri));
        }
        debug!(chain_id, "waiting for remote wallet approval");

        let approval = self.client.approval().await;
        self.pairing.send_replace(None);
        approval.map_err(|e| {
            if e.is_user_rejected() {
                info!("remote wallet rejected the session");
            }
            ActivationError::from(e)
        })
    }
}

async fn read_chain_id(provider: &SessionProvider) -> Result<ChainId> {
    let value = provider.request("eth_chainId", json!([])).await?;
    Ok(parse_chain_id(&value)?)
}

#[async_trait]
impl Connector for RemoteSessionConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::RemoteSession
    }

    async fn activate(&self) -> Result<Activation> {
        if let Some(session) = self.slot.current() {
            let chain_id = read_chain_id(&session).await?;
            self.ensure_supported(chain_id)?;
            let provider: SharedProvider = session;
            return Ok(Activation { provider, chain_id });
        }

        let epoch = self.slot.epoch();
        let approval = self.pair().await?;
        let Some(&account) = approval.accounts.first() else {
            return Err(ActivationError::unknown("remote wallet exposed no accounts"));
        };
        if let Err(e) = self.ensure_supported(approval.chain_id) {
            warn!(chain_id = approval.chain_id, "remote wallet approved an unsupported chain");
            if let Err(err) = self.client.disconnect().await {
                warn!(error = %err, "failed to kill remote session");
            }
            return Err(e);
        }

        let session = Arc::new(SessionProvider::new(self.client.provider()));
        let session = match self.slot.install(epoch, session) {
            Install::Installed(session) => session,
            Install::Existing { existing, discarded } => {
                discarded.mark_closed();
                existing
            }
            Install::Cancelled(session) => {
                self.teardown(&session).await;
                return Err(cancelled(ConnectorKind::RemoteSession));
            }
        };
        info!(chain_id = approval.chain_id, %account, "remote session approved");

        let provider: SharedProvider = session;
        Ok(Activation {
            provider,
            chain_id: approval.chain_id,
        })
    }

    async fn account(&self) -> Result<Address> {
        let session = self.current()?;
        let value = session.request("eth_accounts", json!([])).await?;
        parse_accounts(&value)?
            .first()
            .copied()
            .ok_or_else(|| ActivationError::unknown("remote wallet exposed no accounts"))
    }

    async fn chain_id(&self) -> Result<ChainId> {
        let session = self.current()?;
        read_chain_id(&session).await
    }

    async fn provider(&self) -> Result<SharedProvider> {
        let provider: SharedProvider = self.current()?;
        Ok(provider)
    }

    async fn deactivate(&self) {
        self.pairing.send_replace(None);
        if let Some(session) = self.slot.take() {
            self.teardown(&session).await;
            debug!("remote session connector deactivated");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::test_support::{MockSessionClient, TEST_ADDRESS};

    fn config() -> RemoteSessionConfig {
        RemoteSessionConfig::new([
            (1, "https://mainnet.example".to_owned()),
            (4, "https://rinkeby.example".to_owned()),
        ])
    }

    #[tokio::test]
    async fn test_pairing_publishes_uri_until_approved() {
        let (client, gate) = MockSessionClient::gated(1, TEST_ADDRESS);
        let connector = Arc::new(RemoteSessionConnector::new(config(), client));
        let mut uri = connector.pairing_uri();

        let task = tokio::spawn({
            let connector = Arc::clone(&connector);
            async move { connector.activate().await }
        });

        let published = uri.wait_for(Option::is_some).await.unwrap().clone();
        assert!(published.unwrap().starts_with("wc:"));

        gate.send(()).unwrap();
        let activation = task.await.unwrap().unwrap();
        assert_eq!(activation.chain_id, 1);
        assert_eq!(*connector.pairing_uri().borrow(), None);
        assert_eq!(
            connector.account().await.unwrap(),
            TEST_ADDRESS.parse::<Address>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_rejected_pairing() {
        let client = MockSessionClient::rejecting();
        let connector = RemoteSessionConnector::new(config(), client);
        assert!(connector.activate().await.unwrap_err().is_user_rejected());
        assert!(connector.provider().await.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_chain_on_approval_kills_session() {
        let client = MockSessionClient::new(56, TEST_ADDRESS);
        let connector = RemoteSessionConnector::new(config(), Arc::clone(&client) as _);
        assert_eq!(
            connector.activate().await.unwrap_err(),
            ActivationError::unsupported_chain(56, &[1, 4])
        );
        assert_eq!(client.disconnects.load(Ordering::SeqCst), 1);
        assert!(connector.provider().await.is_err());
        assert!(connector.chain_id().await.is_err());
        assert_eq!(*connector.pairing_uri().borrow(), None);
    }

    #[tokio::test]
    async fn test_close_reports_session_closed_once() {
        let client = MockSessionClient::new(1, TEST_ADDRESS);
        let connector = RemoteSessionConnector::new(config(), Arc::clone(&client) as _);
        let activation = connector.activate().await.unwrap();
        let mut events = activation.provider.subscribe();

        connector.close().await;
        connector.close().await;

        assert_eq!(events.next().await, Some(ProviderEvent::SessionClosed));
        let next = tokio::time::timeout(Duration::from_millis(50), events.next()).await;
        assert!(next.is_err(), "relay disconnect should be suppressed");
        assert_eq!(client.disconnects.load(Ordering::SeqCst), 1);

        let err = activation
            .provider
            .request("eth_chainId", json!([]))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcError::DISCONNECTED);
    }

    #[tokio::test]
    async fn test_remote_disconnect_is_forwarded() {
        let client = MockSessionClient::new(1, TEST_ADDRESS);
        let connector = RemoteSessionConnector::new(config(), Arc::clone(&client) as _);
        let activation = connector.activate().await.unwrap();
        let mut events = activation.provider.subscribe();

        client.provider.emit(ProviderEvent::Disconnect);
        assert_eq!(events.next().await, Some(ProviderEvent::Disconnect));
    }
}
