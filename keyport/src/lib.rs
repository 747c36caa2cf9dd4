#![cfg_attr(docsrs, feature(doc_cfg))]
//! Keyport connects an application to an Ethereum wallet through one of
//! several connection methods and keeps a single, consistent view of which
//! one is active.
//!
//! - [`connector`] - injected provider, remote session, hardware device, raw secret
//! - [`coordinator`] - activation state machine, supersession and event reconciliation
//! - [`secret`] - mnemonic and keystore resolution into a private key
//! - [`provider`] - the EIP-1193 handle every connector produces, plus the
//!   locally composed engine used by hardware and raw-secret connectors
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use keyport::prelude::*;
//!
//! # async fn run() -> keyport::error::Result<()> {
//! let coordinator = ActivationCoordinator::new(
//!     CoordinatorConfig::default().with_supported_chain_ids([1, 5]),
//! );
//! let config = ConnectorConfig::new(1, "https://rpc.example");
//! let connector = RawSecretConnector::from_mnemonic(config, "abandon ... about", None)?;
//! coordinator.activate(Arc::new(connector)).await?;
//!
//! let snapshot = coordinator.snapshot();
//! if let Some(client) = snapshot.client() {
//!     let block = client.block_number().await.map_err(ActivationError::from)?;
//!     println!("connected at block {block}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod coordinator;
pub mod error;
pub mod prelude;
pub mod provider;
pub mod secret;

#[cfg(test)]
mod test_support;

/// EIP-155 chain id.
pub type ChainId = u64;

pub use connector::{Connector, ConnectorKind, SharedConnector};
pub use coordinator::{ActivationCoordinator, ActivationOutcome, ActivationSnapshot, ActivationStatus};
pub use error::{ActivationError, Result, RpcError};
pub use provider::{ChainClient, Eip1193, ProviderEvent, SharedProvider};
