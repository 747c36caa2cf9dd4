//! Provider handles produced by active connectors.
//!
//! Every connector, whatever its connection method, hands out the same opaque
//! handle: an [`Eip1193`] request/notification surface. Downstream code wraps
//! it in a [`ChainClient`] for typed reads and signing.
//!
//! # Architecture
//!
//! ```text
//! SharedProvider (Arc<dyn Eip1193>)
//!   ├── request()    → JSON-RPC style method call
//!   └── subscribe()  → EventStream of ProviderEvent
//!
//! ProviderEngine (raw-secret and hardware connectors)
//!   ├── AccountSigner → eth_accounts / personal_sign
//!   ├── ReadCache     → permanent and block-scoped read results
//!   └── RpcTransport  → everything else (HTTP JSON-RPC via alloy)
//! ```

mod cache;
mod client;
mod engine;
mod transport;

pub use cache::{CachePolicy, ReadCache};
pub use client::ChainClient;
pub use engine::{AccountSigner, LocalKeySigner, ProviderEngine};
pub use transport::{HttpTransport, RpcTransport};

use std::fmt;
use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::ChainId;
use crate::error::RpcError;

/// Default number of buffered notifications per subscriber.
const EVENT_CAPACITY: usize = 64;

/// Notification emitted by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProviderEvent {
    /// A new block was observed.
    Block(u64),
    /// The exposed accounts changed. An empty list means access was revoked.
    AccountsChanged(Vec<Address>),
    /// The provider switched to another chain.
    ChainChanged(ChainId),
    /// The provider lost its connection.
    Disconnect,
    /// A remote session was closed from this side.
    ///
    /// Distinct from [`Disconnect`](Self::Disconnect), which is reported by the
    /// protocol itself.
    SessionClosed,
}

/// A boxed stream of provider notifications.
pub type EventStream = BoxStream<'static, ProviderEvent>;

/// EIP-1193 provider surface.
///
/// Implementations are black boxes owned by a connector: an injected browser
/// provider, a remote wallet session, or a locally composed
/// [`ProviderEngine`].
#[async_trait]
pub trait Eip1193: Send + Sync + fmt::Debug {
    /// Send a JSON-RPC style request.
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError>;

    /// Subscribe to notifications emitted from now on.
    fn subscribe(&self) -> EventStream;
}

/// Shared provider handle. Read calls may be issued concurrently.
pub type SharedProvider = Arc<dyn Eip1193>;

/// Broadcast hub for provider notifications.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProviderEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Events with no subscriber are dropped.
    pub fn emit(&self, event: ProviderEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe as a stream.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        event_stream(self.tx.subscribe())
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapt a broadcast receiver into an [`EventStream`].
///
/// Lagging subscribers skip the dropped events; the stream ends when the
/// sender is gone.
#[must_use]
pub fn event_stream(mut rx: broadcast::Receiver<ProviderEvent>) -> EventStream {
    Box::pin(async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => yield event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "provider event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Parse a chain id from a hex quantity, decimal string or JSON number.
pub fn parse_chain_id(value: &Value) -> Result<ChainId, RpcError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| RpcError::internal(format!("invalid chain id: {n}"))),
        Value::String(s) => parse_quantity(s),
        other => Err(RpcError::internal(format!("invalid chain id: {other}"))),
    }
}

/// Parse a `0x`-prefixed hex quantity or plain decimal string.
pub fn parse_quantity(s: &str) -> Result<u64, RpcError> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|e| RpcError::internal(format!("invalid quantity '{s}': {e}")))
}

/// Encode a number as a JSON-RPC hex quantity.
#[must_use]
pub fn quantity(n: u64) -> Value {
    Value::String(format!("{n:#x}"))
}

/// Parse an `eth_accounts` style result.
pub fn parse_accounts(value: &Value) -> Result<Vec<Address>, RpcError> {
    let Value::Array(items) = value else {
        return Err(RpcError::internal(format!("invalid accounts list: {value}")));
    };
    items
        .iter()
        .map(|item| {
            item.as_str()
                .and_then(|s| s.parse::<Address>().ok())
                .ok_or_else(|| RpcError::internal(format!("invalid account: {item}")))
        })
        .collect()
}
