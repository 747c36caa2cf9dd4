//! Connectors: one adapter per connection method.
//!
//! Every connector exposes the same lifecycle so the coordinator can treat
//! them uniformly:
//!
//! ```text
//! activate()    → Activation { provider, chain_id }   (idempotent)
//! account()     → primary address                     (after activate)
//! chain_id()    → current chain                       (after activate)
//! provider()    → SharedProvider                      (after activate)
//! deactivate()  → release transport / session / poller (idempotent)
//! ```
//!
//! | Connector                 | Provider                   | Supported chains      |
//! |---------------------------|----------------------------|-----------------------|
//! | [`InjectedConnector`]     | host-injected EIP-1193     | configured, or any    |
//! | [`RemoteSessionConnector`]| remote wallet session      | keys of the RPC map   |
//! | [`HardwareConnector`]     | [`ProviderEngine`] + device| `[chain_id]`          |
//! | [`RawSecretConnector`]    | [`ProviderEngine`] + key   | `[chain_id]`          |
//!
//! [`ProviderEngine`]: crate::provider::ProviderEngine

mod hardware;
mod injected;
mod remote;
mod secret;

pub use hardware::{DeviceError, DeviceSigner, HardwareConnector, HardwareDevice, HardwareTransport};
pub use injected::{InjectedConnector, ProviderDetector};
pub use remote::{RemoteSessionConnector, SessionApproval, SessionClient};
pub use secret::RawSecretConnector;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;

use crate::ChainId;
use crate::error::{ActivationError, Result};
use crate::provider::{HttpTransport, RpcTransport, SharedProvider};

/// Connection method of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    /// Provider injected by the host environment.
    Injected,
    /// Remote wallet paired over a relay.
    RemoteSession,
    /// Hardware wallet on a local transport.
    Hardware,
    /// Private key, mnemonic or keystore held in memory.
    RawSecret,
}

impl ConnectorKind {
    /// Short lowercase name, used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Injected => "injected",
            Self::RemoteSession => "remote-session",
            Self::Hardware => "hardware",
            Self::RawSecret => "raw-secret",
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful [`Connector::activate`].
#[derive(Debug, Clone)]
pub struct Activation {
    /// Provider handle for the session.
    pub provider: SharedProvider,
    /// Chain the session is on.
    pub chain_id: ChainId,
}

/// A connection method.
///
/// Implementations use interior mutability so a single instance can be shared
/// between the application and the coordinator as an `Arc<dyn Connector>`.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Connection method.
    fn kind(&self) -> ConnectorKind;

    /// Establish a session. Calling it again while active reuses the session.
    async fn activate(&self) -> Result<Activation>;

    /// Primary account of the active session.
    async fn account(&self) -> Result<Address>;

    /// Chain of the active session.
    async fn chain_id(&self) -> Result<ChainId>;

    /// Provider of the active session.
    async fn provider(&self) -> Result<SharedProvider>;

    /// Release everything acquired by [`activate`](Self::activate). Idempotent.
    async fn deactivate(&self);
}

/// Shared connector handle.
pub type SharedConnector = Arc<dyn Connector>;

pub(crate) fn not_active(kind: ConnectorKind) -> ActivationError {
    ActivationError::unknown(format!("{kind} connector is not active"))
}

pub(crate) fn cancelled(kind: ConnectorKind) -> ActivationError {
    ActivationError::unknown(format!("{kind} connector was deactivated during activation"))
}

/// Connect the read transport for an engine-backed connector.
pub(crate) async fn connect_rpc(
    url: &str,
    timeout: Option<Duration>,
) -> Result<Arc<dyn RpcTransport>> {
    let transport = HttpTransport::connect(url, timeout)
        .await
        .map_err(|e| ActivationError::unknown(e.message))?;
    Ok(Arc::new(transport))
}

/// Outcome of [`SessionSlot::install`].
pub(crate) enum Install<S> {
    /// The session is now current.
    Installed(S),
    /// Another activation won; `discarded` must be torn down.
    Existing { existing: S, discarded: S },
    /// The connector was deactivated meanwhile; the session must be torn down.
    Cancelled(S),
}

/// Holds a connector's live session.
///
/// Sessions are built without holding the lock and installed afterwards, so a
/// deactivate issued during a slow handshake is never blocked. The epoch
/// counter lets an install detect that.
pub(crate) struct SessionSlot<S> {
    session: Mutex<Option<S>>,
    epoch: AtomicU64,
}

impl<S: Clone> SessionSlot<S> {
    pub(crate) const fn new() -> Self {
        Self {
            session: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    pub(crate) fn current(&self) -> Option<S> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn install(&self, epoch: u64, session: S) -> Install<S> {
        let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Install::Cancelled(session);
        }
        match slot.as_ref() {
            Some(existing) => Install::Existing {
                existing: existing.clone(),
                discarded: session,
            },
            None => {
                *slot = Some(session.clone());
                Install::Installed(session)
            }
        }
    }

    /// Remove the session and invalidate in-flight installs.
    pub(crate) fn take(&self) -> Option<S> {
        let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        slot.take()
    }
}

impl<S> fmt::Debug for SessionSlot<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("SessionSlot")
            .field("active", &active)
            .field("epoch", &self.epoch.load(Ordering::SeqCst))
            .finish()
    }
}
