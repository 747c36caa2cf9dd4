//! Activation coordinator: owns the single "current connector" state.
//!
//! # State machine
//!
//! ```text
//!            activate(c)                 ok
//!   Idle ───────────────▶ Activating ─────────▶ Active
//!    ▲                        │                   │
//!    │                        │ err               │ deactivate / disconnect /
//!    │                        ▼                   │ accounts revoked
//!    │                      Error ◀───────────────┘ chain unsupported
//!    └──────────────────────────────────────────────────────────────────
//! ```
//!
//! Every attempt gets a sequence number. Only the latest attempt may write
//! state; an older attempt that resolves late is discarded
//! ([`ActivationOutcome::Superseded`]) and its connector released if nothing
//! else uses it. A failed attempt never tears down the installed session.
//!
//! While a session is installed, a reconciler task watches its provider and
//! feeds notifications back through the same attempt path.

mod eager;
mod reconciler;
mod state;

pub use eager::InactiveListener;
pub use state::{ActivationSnapshot, ActivationStatus};

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use alloy::primitives::Address;
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use self::state::{ActivationState, CurrentSession, PendingAttempt};
use crate::config::{CoordinatorConfig, ensure_chain_supported};
use crate::connector::{Activation, SharedConnector};
use crate::error::{ActivationError, Result};
use crate::provider::ProviderEvent;

/// Result of an activation request that did not fail.
#[derive(Debug, Clone)]
pub enum ActivationOutcome {
    /// The connector is now current.
    Activated(ActivationSnapshot),
    /// A newer request (or a deactivation) was issued first; nothing changed.
    Superseded,
}

impl ActivationOutcome {
    /// Returns `true` if the result was discarded.
    #[must_use]
    pub const fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded)
    }
}

/// Whether a failed attempt is recorded in the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reporting {
    Record,
    /// No prompt was shown, so the failure is not the user's concern.
    Silent,
    /// Like `Silent`, but only starts while the coordinator is idle.
    SilentIfIdle,
}

enum Handshake {
    Ready {
        activation: Activation,
        account: Address,
    },
    /// The connector opened a session that cannot be used.
    Refused(ActivationError),
    Failed(ActivationError),
}

pub(crate) struct Inner {
    config: CoordinatorConfig,
    state: Mutex<ActivationState>,
    updates: watch::Sender<ActivationSnapshot>,
    eager_tried: AtomicBool,
}

/// Coordinates connector activation, switching and teardown.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ActivationCoordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for ActivationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ActivationCoordinator")
            .field("config", &self.inner.config)
            .field("status", &state.status())
            .field("sequence", &state.sequence)
            .finish_non_exhaustive()
    }
}

impl Default for ActivationCoordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

impl ActivationCoordinator {
    /// Create an idle coordinator.
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Self {
        let (updates, _) = watch::channel(ActivationSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ActivationState::default()),
                updates,
                eager_tried: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) const fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Coordinator configuration.
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> ActivationSnapshot {
        self.lock().snapshot()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ActivationSnapshot> {
        self.inner.updates.subscribe()
    }

    /// The installed connector, if any.
    #[must_use]
    pub fn current_connector(&self) -> Option<SharedConnector> {
        self.lock()
            .current
            .as_ref()
            .map(|current| Arc::clone(&current.connector))
    }

    /// Activate `connector`, superseding any attempt still in flight.
    ///
    /// On failure the error is recorded in the state and returned; a
    /// previously installed connector stays installed.
    ///
    /// # Errors
    ///
    /// Returns the normalized [`ActivationError`] of this attempt.
    pub async fn activate(&self, connector: SharedConnector) -> Result<ActivationOutcome> {
        self.attempt(connector, Reporting::Record, None).await
    }

    /// Deactivate the installed connector and return to idle.
    ///
    /// Supersedes any attempt in flight and clears the last error. Idempotent.
    pub async fn deactivate(&self) {
        self.teardown(None).await;
    }

    /// Forget the last error.
    pub fn clear_error(&self) {
        let mut state = self.lock();
        if state.last_error.take().is_some() {
            self.publish(&state);
        }
    }

    /// Deactivate and stop reconciling. The coordinator can be reused afterwards.
    pub async fn shutdown(&self) {
        self.teardown(None).await;
        info!("activation coordinator shut down");
    }

    fn lock(&self) -> MutexGuard<'_, ActivationState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &ActivationState) {
        self.inner.updates.send_replace(state.snapshot());
    }

    /// Start reconciling events of the installed provider.
    fn watch_current(&self, state: &mut ActivationState) {
        let Some(events) = state.current.as_ref().map(|c| c.provider.subscribe()) else {
            return;
        };
        let id = state.next_monitor_id();
        state.monitor = Some(reconciler::spawn(Arc::downgrade(&self.inner), id, events));
    }

    async fn handshake(&self, connector: &SharedConnector) -> Handshake {
        let activation = match connector.activate().await {
            Ok(activation) => activation,
            Err(e) => return Handshake::Failed(e),
        };
        let account = match connector.account().await {
            Ok(account) => account,
            Err(e) => return Handshake::Refused(e),
        };
        let supported = self.inner.config.supported_chain_ids.as_deref();
        match ensure_chain_supported(activation.chain_id, supported) {
            Ok(()) => Handshake::Ready {
                activation,
                account,
            },
            Err(e) => Handshake::Refused(e),
        }
    }

    /// Run one activation attempt.
    ///
    /// With `guard` set, the attempt only starts if that monitor is still
    /// installed. Both start checks share the lock that claims the sequence.
    async fn attempt(
        &self,
        connector: SharedConnector,
        reporting: Reporting,
        guard: Option<u64>,
    ) -> Result<ActivationOutcome> {
        let kind = connector.kind();
        let seq = {
            let mut state = self.lock();
            if guard.is_some() && state.monitor_id() != guard {
                return Ok(ActivationOutcome::Superseded);
            }
            if reporting == Reporting::SilentIfIdle && state.status() != ActivationStatus::Idle {
                return Ok(ActivationOutcome::Superseded);
            }
            let seq = state.next_sequence();
            state.monitor = None;
            state.activating = Some(PendingAttempt {
                seq,
                connector: Arc::clone(&connector),
            });
            self.publish(&state);
            seq
        };

        let span = info_span!("activation", seq, connector = %kind);
        let handshake = self.handshake(&connector).instrument(span).await;

        // Failed attempts opened nothing; anything else holds a session.
        let opened = !matches!(handshake, Handshake::Failed(_));
        let (outcome, release) = {
            let mut state = self.lock();
            if !state.is_current_attempt(seq) {
                debug!(seq, connector = %kind, "discarding superseded activation result");
                let release = (opened && !state.in_use(&connector)).then(|| Arc::clone(&connector));
                (Ok(ActivationOutcome::Superseded), release)
            } else {
                state.activating = None;
                match handshake {
                    Handshake::Ready {
                        activation,
                        account,
                    } => {
                        let chain_id = activation.chain_id;
                        let previous = state.current.replace(CurrentSession {
                            connector: Arc::clone(&connector),
                            provider: activation.provider,
                            chain_id,
                            account,
                        });
                        state.last_error = None;
                        self.watch_current(&mut state);
                        self.publish(&state);
                        info!(seq, connector = %kind, chain_id, %account, "connector activated");

                        let release = previous.map(|p| p.connector).filter(|p| {
                            self.inner.config.deactivate_replaced && !Arc::ptr_eq(p, &connector)
                        });
                        (Ok(ActivationOutcome::Activated(state.snapshot())), release)
                    }
                    Handshake::Refused(err) | Handshake::Failed(err) => {
                        if reporting == Reporting::Record {
                            warn!(seq, connector = %kind, error = %err, "activation failed");
                            state.last_error = Some(err.clone());
                        } else {
                            debug!(seq, connector = %kind, error = %err, "silent activation failed");
                        }
                        let release = (opened && !state.in_use(&connector)).then(|| Arc::clone(&connector));
                        self.watch_current(&mut state);
                        self.publish(&state);
                        (Err(err), release)
                    }
                }
            }
        };

        if let Some(connector) = release {
            debug!(connector = %connector.kind(), "releasing unused connector");
            connector.deactivate().await;
        }
        outcome
    }

    /// Clear the state and deactivate the installed connector.
    ///
    /// With `guard` set, nothing happens unless that monitor is still installed.
    async fn teardown(&self, guard: Option<u64>) {
        let released = {
            let mut state = self.lock();
            if guard.is_some() && state.monitor_id() != guard {
                return;
            }
            state.next_sequence();
            state.monitor = None;
            state.activating = None;
            state.last_error = None;
            let released = state.current.take();
            self.publish(&state);
            released
        };
        if let Some(session) = released {
            info!(connector = %session.connector.kind(), "connector deactivated");
            session.connector.deactivate().await;
        }
    }

    /// Apply one provider notification from monitor `monitor`.
    pub(crate) async fn reconcile(&self, monitor: u64, event: ProviderEvent) {
        let current = {
            let state = self.lock();
            if state.monitor_id() != Some(monitor) {
                trace!(monitor, "ignoring event from superseded provider");
                return;
            }
            state.current.clone()
        };
        let Some(current) = current else {
            return;
        };
        let kind = current.connector.kind();

        match event {
            ProviderEvent::Block(_) => {}
            ProviderEvent::AccountsChanged(accounts) => match accounts.first() {
                None => {
                    info!(connector = %kind, "accounts revoked");
                    self.teardown(Some(monitor)).await;
                }
                Some(account) if *account == current.account => {}
                Some(account) => {
                    info!(connector = %kind, %account, "account changed");
                    let _ = self
                        .attempt(current.connector, Reporting::Record, Some(monitor))
                        .await;
                }
            },
            ProviderEvent::ChainChanged(chain_id) => {
                info!(connector = %kind, chain_id, "chain changed");
                let _ = self
                    .attempt(current.connector, Reporting::Record, Some(monitor))
                    .await;
            }
            ProviderEvent::Disconnect => {
                info!(connector = %kind, "provider disconnected");
                self.teardown(Some(monitor)).await;
            }
            ProviderEvent::SessionClosed => {
                info!(connector = %kind, "session closed");
                self.teardown(Some(monitor)).await;
            }
        }
    }
}
