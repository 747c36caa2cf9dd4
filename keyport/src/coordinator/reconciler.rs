//! Event reconciler: feeds provider notifications of the installed connector
//! back into the coordinator.
//!
//! One reconciler task runs per installed session. Each carries a monitor id;
//! the coordinator drops events whose id no longer matches the installed
//! monitor, so a superseded provider can never mutate state. Events are
//! handled one at a time, in order.

use std::sync::Weak;

use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::{ActivationCoordinator, Inner};
use crate::provider::EventStream;

/// Handle to a running reconciler task. Dropping it stops the task.
#[derive(Debug)]
pub(crate) struct Monitor {
    id: u64,
    _shutdown: oneshot::Sender<()>,
}

impl Monitor {
    pub(crate) const fn id(&self) -> u64 {
        self.id
    }
}

/// Spawn a reconciler for `events`.
///
/// Stopping never interrupts an event that is already being reconciled; the
/// task exits before picking up the next one.
pub(crate) fn spawn(coordinator: Weak<Inner>, id: u64, mut events: EventStream) -> Monitor {
    let (shutdown, mut stopped) = oneshot::channel::<()>();
    tokio::spawn(async move {
        debug!(monitor = id, "reconciler started");
        loop {
            let event = tokio::select! {
                biased;
                _ = &mut stopped => break,
                next = events.next() => match next {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(inner) = coordinator.upgrade() else {
                break;
            };
            trace!(monitor = id, ?event, "provider event");
            ActivationCoordinator::from_inner(inner)
                .reconcile(id, event)
                .await;
        }
        debug!(monitor = id, "reconciler stopped");
    });
    Monitor {
        id,
        _shutdown: shutdown,
    }
}
