//! Activation state and its published snapshot.

use std::fmt;
use std::sync::Arc;

use alloy::primitives::Address;

use super::reconciler::Monitor;
use crate::ChainId;
use crate::connector::{ConnectorKind, SharedConnector};
use crate::error::ActivationError;
use crate::provider::{ChainClient, SharedProvider};

/// Coarse lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationStatus {
    /// Nothing connected and no pending failure.
    #[default]
    Idle,
    /// An activation attempt is in flight.
    Activating,
    /// A connector is installed and no error is pending.
    Active,
    /// The last attempt failed. A previously installed connector may still be live.
    Error,
}

impl fmt::Display for ActivationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Error => "error",
        })
    }
}

/// Point-in-time view of the activation state.
///
/// Published on every transition; see
/// [`ActivationCoordinator::subscribe`](super::ActivationCoordinator::subscribe).
#[derive(Debug, Clone, Default)]
pub struct ActivationSnapshot {
    /// Lifecycle status.
    pub status: ActivationStatus,
    /// Kind of the installed connector.
    pub connector: Option<ConnectorKind>,
    /// Kind of the connector currently being activated.
    pub activating: Option<ConnectorKind>,
    /// Provider of the installed connector.
    pub provider: Option<SharedProvider>,
    /// Chain of the installed connector.
    pub chain_id: Option<ChainId>,
    /// Primary account of the installed connector.
    pub account: Option<Address>,
    /// Failure of the last attempt, kept until the next success or an explicit clear.
    pub last_error: Option<ActivationError>,
}

impl ActivationSnapshot {
    /// Returns `true` if a connector is installed and no error is pending.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ActivationStatus::Active
    }

    /// Typed client over the installed provider.
    #[must_use]
    pub fn client(&self) -> Option<ChainClient> {
        self.provider.clone().map(ChainClient::new)
    }
}

/// The installed connector and what it reported.
#[derive(Debug, Clone)]
pub(crate) struct CurrentSession {
    pub(crate) connector: SharedConnector,
    pub(crate) provider: SharedProvider,
    pub(crate) chain_id: ChainId,
    pub(crate) account: Address,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingAttempt {
    pub(crate) seq: u64,
    pub(crate) connector: SharedConnector,
}

/// Mutable state owned by the coordinator. Guarded by a single mutex.
#[derive(Debug, Default)]
pub(crate) struct ActivationState {
    pub(crate) sequence: u64,
    pub(crate) current: Option<CurrentSession>,
    pub(crate) activating: Option<PendingAttempt>,
    pub(crate) last_error: Option<ActivationError>,
    pub(crate) monitor: Option<Monitor>,
    monitor_ids: u64,
}

impl ActivationState {
    pub(crate) const fn status(&self) -> ActivationStatus {
        if self.activating.is_some() {
            ActivationStatus::Activating
        } else if self.last_error.is_some() {
            ActivationStatus::Error
        } else if self.current.is_some() {
            ActivationStatus::Active
        } else {
            ActivationStatus::Idle
        }
    }

    /// Issue the next attempt number, superseding every earlier one.
    pub(crate) const fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    pub(crate) const fn next_monitor_id(&mut self) -> u64 {
        self.monitor_ids += 1;
        self.monitor_ids
    }

    pub(crate) fn monitor_id(&self) -> Option<u64> {
        self.monitor.as_ref().map(Monitor::id)
    }

    /// Returns `true` if attempt `seq` is still the one allowed to write.
    pub(crate) fn is_current_attempt(&self, seq: u64) -> bool {
        self.sequence == seq && self.activating.as_ref().is_some_and(|a| a.seq == seq)
    }

    /// Returns `true` if `connector` is installed or being activated.
    pub(crate) fn in_use(&self, connector: &SharedConnector) -> bool {
        self.current
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(&c.connector, connector))
            || self
                .activating
                .as_ref()
                .is_some_and(|a| Arc::ptr_eq(&a.connector, connector))
    }

    pub(crate) fn snapshot(&self) -> ActivationSnapshot {
        let current = self.current.as_ref();
        ActivationSnapshot {
            status: self.status(),
            connector: current.map(|c| c.connector.kind()),
            activating: self.activating.as_ref().map(|a| a.connector.kind()),
            provider: current.map(|c| Arc::clone(&c.provider)),
            chain_id: current.map(|c| c.chain_id),
            account: current.map(|c| c.account),
            last_error: self.last_error.clone(),
        }
    }
}
