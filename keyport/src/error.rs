//! Unified error types for keyport.
//!
//! This module provides the error hierarchy shared by every connection method:
//! - [`ActivationError`] - the normalized taxonomy the coordinator stores and reports
//! - [`RpcError`] - EIP-1193 style provider errors raised inside connectors
//!
//! Connector-internal faults never reach the coordinator in their raw form; they
//! are converted into an [`ActivationError`] at the connector boundary.

use std::fmt;

use crate::ChainId;

/// Result type alias for keyport operations.
pub type Result<T, E = ActivationError> = std::result::Result<T, E>;

/// The normalized activation failure taxonomy.
///
/// This is the only error type the activation coordinator ever observes. It is
/// `Clone` so that the last failure can be retained in the shared state
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ActivationError {
    /// No compatible injected provider exists in the host environment.
    #[error("no injected Ethereum provider found")]
    NoProviderFound,

    /// The negotiated chain is outside the supported set.
    #[error("unsupported chain id {requested} (supported: {})", DisplayChains(.supported))]
    UnsupportedChain {
        /// The chain id the connector reported.
        requested: ChainId,
        /// The chain ids that would have been accepted.
        supported: Vec<ChainId>,
    },

    /// The user (or the device) declined the request.
    #[error("the user rejected the request")]
    UserRejected,

    /// A hardware transport could not be opened or stopped responding.
    #[error("hardware device unreachable: {0}")]
    DeviceUnreachable(String),

    /// A private key, mnemonic or keystore file was malformed or could not be decrypted.
    #[error("invalid secret material: {0}")]
    InvalidSecretMaterial(String),

    /// Any other failure, carrying the underlying cause.
    #[error("{0}")]
    Unknown(String),
}

impl ActivationError {
    /// Create an [`UnsupportedChain`](Self::UnsupportedChain) error.
    #[must_use]
    pub fn unsupported_chain(requested: ChainId, supported: &[ChainId]) -> Self {
        Self::UnsupportedChain {
            requested,
            supported: supported.to_vec(),
        }
    }

    /// Create a [`DeviceUnreachable`](Self::DeviceUnreachable) error.
    #[must_use]
    pub fn device_unreachable(msg: impl Into<String>) -> Self {
        Self::DeviceUnreachable(msg.into())
    }

    /// Create an [`InvalidSecretMaterial`](Self::InvalidSecretMaterial) error.
    #[must_use]
    pub fn invalid_secret(msg: impl Into<String>) -> Self {
        Self::InvalidSecretMaterial(msg.into())
    }

    /// Create an [`Unknown`](Self::Unknown) error.
    #[must_use]
    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    /// Returns `true` if the user declined the request.
    #[must_use]
    pub const fn is_user_rejected(&self) -> bool {
        matches!(self, Self::UserRejected)
    }

    /// Returns `true` for chain mismatches, which never tear down an existing session.
    #[must_use]
    pub const fn is_unsupported_chain(&self) -> bool {
        matches!(self, Self::UnsupportedChain { .. })
    }

    /// Message suitable for showing to an end user.
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::NoProviderFound => {
                "No Ethereum browser extension detected, install MetaMask on desktop or visit from a dApp browser on mobile."
            }
            Self::UnsupportedChain { .. } => "You're connected to an unsupported network.",
            Self::UserRejected => "Please authorize this website to access your Ethereum account.",
            Self::DeviceUnreachable(_) => {
                "Could not reach the hardware wallet. Check that it is connected and unlocked."
            }
            Self::InvalidSecretMaterial(_) => "Invalid wallet file, mnemonic or private key.",
            Self::Unknown(_) => "An unknown error occurred. Check the logs for more details.",
        }
    }
}

struct DisplayChains<'a>(&'a [ChainId]);

impl fmt::Display for DisplayChains<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("none");
        }
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{id}")?;
        }
        Ok(())
    }
}

/// Error returned by an EIP-1193 provider request.
///
/// Mirrors the `ProviderRpcError` shape: a numeric code, a message and an
/// optional data payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("provider error {code}: {message}")]
pub struct RpcError {
    /// Numeric error code (EIP-1193 or JSON-RPC).
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured payload.
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    /// The user rejected the request.
    pub const USER_REJECTED: i64 = 4001;
    /// The requested method or account has not been authorized.
    pub const UNAUTHORIZED: i64 = 4100;
    /// The provider does not support the method.
    pub const UNSUPPORTED_METHOD: i64 = 4200;
    /// The provider is disconnected from all chains.
    pub const DISCONNECTED: i64 = 4900;
    /// The provider is not connected to the requested chain.
    pub const CHAIN_DISCONNECTED: i64 = 4901;
    /// JSON-RPC invalid params.
    pub const INVALID_PARAMS: i64 = -32602;
    /// JSON-RPC internal error.
    pub const INTERNAL: i64 = -32603;

    /// Create an error with an explicit code.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach a data payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// User rejection (code 4001).
    #[must_use]
    pub fn user_rejected() -> Self {
        Self::new(Self::USER_REJECTED, "User rejected the request.")
    }

    /// Unsupported method (code 4200).
    #[must_use]
    pub fn unsupported_method(method: &str) -> Self {
        Self::new(
            Self::UNSUPPORTED_METHOD,
            format!("method '{method}' is not supported"),
        )
    }

    /// Disconnected provider (code 4900).
    #[must_use]
    pub fn disconnected() -> Self {
        Self::new(Self::DISCONNECTED, "provider is disconnected")
    }

    /// Invalid params (code -32602).
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    /// Internal error (code -32603).
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL, message)
    }

    /// Returns `true` if this error signals a user rejection.
    #[must_use]
    pub const fn is_user_rejected(&self) -> bool {
        self.code == Self::USER_REJECTED
    }
}

impl From<RpcError> for ActivationError {
    fn from(err: RpcError) -> Self {
        if err.is_user_rejected() {
            Self::UserRejected
        } else {
            Self::Unknown(err.to_string())
        }
    }
}
