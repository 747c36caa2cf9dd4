//! Startup helpers for the injected connector.
//!
//! - [`ActivationCoordinator::activate_eagerly`] reconnects a previously
//!   authorized injected provider without prompting.
//! - [`ActivationCoordinator::listen_while_inactive`] activates it when the
//!   user unlocks the wallet or switches chain while nothing is connected.
//!
//! Both are silent: failures are logged, never recorded as the last error.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::debug;

use super::{ActivationCoordinator, ActivationOutcome, Inner, Reporting};
use crate::connector::InjectedConnector;
use crate::provider::{EventStream, ProviderEvent};

/// Handle to an inactive listener. Dropping it stops listening.
#[derive(Debug)]
#[must_use = "the listener stops when dropped"]
pub struct InactiveListener {
    _shutdown: oneshot::Sender<()>,
}

impl ActivationCoordinator {
    /// Activate `injected` if the host already authorized this application.
    ///
    /// Runs at most once per coordinator; later calls return `false`. Returns
    /// `true` if the connector was installed.
    pub async fn activate_eagerly(&self, injected: Arc<InjectedConnector>) -> bool {
        if self.inner.eager_tried.swap(true, Ordering::SeqCst) {
            debug!("eager activation already attempted");
            return false;
        }
        if !injected.is_authorized().await {
            debug!("injected provider not authorized, staying idle");
            return false;
        }
        matches!(
            self.attempt(injected, Reporting::Silent, None).await,
            Ok(ActivationOutcome::Activated(_))
        )
    }

    /// Activate `injected` whenever its provider reports a chain switch or
    /// newly exposed accounts while the coordinator is idle.
    ///
    /// Returns `None` if no injected provider is present.
    pub fn listen_while_inactive(&self, injected: Arc<InjectedConnector>) -> Option<InactiveListener> {
        let events = injected.detect()?.subscribe();
        let (shutdown, stopped) = oneshot::channel();
        tokio::spawn(listen(Arc::downgrade(&self.inner), injected, events, stopped));
        Some(InactiveListener {
            _shutdown: shutdown,
        })
    }
}

async fn listen(
    coordinator: Weak<Inner>,
    injected: Arc<InjectedConnector>,
    mut events: EventStream,
    mut stopped: oneshot::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = &mut stopped => break,
            next = events.next() => match next {
                Some(event) => event,
                None => break,
            },
        };
        let wake = match event {
            ProviderEvent::ChainChanged(_) => true,
            ProviderEvent::AccountsChanged(accounts) => !accounts.is_empty(),
            _ => false,
        };
        if !wake {
            continue;
        }
        let Some(inner) = coordinator.upgrade() else {
            break;
        };
        let coordinator = ActivationCoordinator::from_inner(inner);
        let connector = Arc::clone(&injected);
        match coordinator.attempt(connector, Reporting::SilentIfIdle, None).await {
            Ok(ActivationOutcome::Activated(_)) => {
                debug!("injected provider changed while idle, activated");
            }
            Ok(ActivationOutcome::Superseded) => {}
            Err(e) => debug!(error = %e, "inactive listener activation failed"),
        }
    }
    debug!("inactive listener stopped");
}
