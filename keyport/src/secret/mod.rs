//! Secret material resolution.
//!
//! Pure conversions that turn user-supplied secret material into a raw
//! private key for a [`RawSecretConnector`](crate::connector::RawSecretConnector):
//!
//! - [`mnemonic_to_private_key`] - BIP-39 phrase + optional passphrase, derived at `m/44'/60'/0'/0/0`
//! - [`keystore_to_private_key`] - encrypted keystore file + password, dispatched by format
//!
//! Nothing here holds connection state.

mod keystore;

pub use keystore::{KeystoreFormat, keystore_to_private_key, keystore_to_private_key_str};

use std::fmt;

use alloy::primitives::{Address, hex};
use alloy::signers::local::PrivateKeySigner;
use zeroize::Zeroizing;

use crate::error::ActivationError;

/// Fixed derivation path for mnemonic-derived keys.
pub const DEFAULT_DERIVATION_PATH: &str = "m/44'/60'/0'/0/0";

/// Error type for secret material resolution.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SecretError {
    /// The mnemonic failed word-list or checksum validation.
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    /// HD derivation failed.
    #[error("key derivation failed: {0}")]
    Derivation(String),

    /// The keystore carries none of the recognized marker fields.
    #[error("invalid wallet file")]
    UnrecognizedKeystore,

    /// The keystore is recognized but structurally broken.
    #[error("malformed keystore: {0}")]
    Malformed(String),

    /// The keystore uses a KDF or cipher that is not supported.
    #[error("unsupported keystore parameter: {0}")]
    Unsupported(String),

    /// Decryption failed or produced a key that does not match the file.
    #[error("wrong passphrase: {0}")]
    WrongPassphrase(String),

    /// A private key had the wrong length.
    #[error("invalid private key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Required length.
        expected: usize,
        /// Length found.
        actual: usize,
    },

    /// The key bytes are not a valid secp256k1 scalar.
    #[error("invalid private key: {0}")]
    InvalidKey(String),
}

impl SecretError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

impl From<SecretError> for ActivationError {
    fn from(err: SecretError) -> Self {
        Self::InvalidSecretMaterial(err.to_string())
    }
}

/// A raw secp256k1 private key as 64 lowercase hex characters, without `0x`.
///
/// The buffer is zeroized on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey(Zeroizing<String>);

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

impl PrivateKey {
    /// Parse a hex key, with or without `0x`.
    pub fn from_hex(key: &str) -> Result<Self, SecretError> {
        let key = key.trim();
        let key = key.strip_prefix("0x").unwrap_or(key);
        let bytes = Zeroizing::new(
            hex::decode(key).map_err(|e| SecretError::InvalidKey(format!("not hex: {e}")))?,
        );
        Self::from_slice(&bytes)
    }

    /// Build from raw key bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SecretError> {
        if bytes.len() != 32 {
            return Err(SecretError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        PrivateKeySigner::from_slice(bytes).map_err(|e| SecretError::InvalidKey(e.to_string()))?;
        Ok(Self(Zeroizing::new(hex::encode(bytes))))
    }

    /// The key as 64 hex characters.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// The address controlled by this key.
    #[must_use]
    pub fn address(&self) -> Option<Address> {
        self.0.parse::<PrivateKeySigner>().ok().map(|s| s.address())
    }
}

/// Derive the private key at `m/44'/60'/0'/0/0` from a BIP-39 mnemonic.
///
/// The phrase is validated (word list and checksum) before derivation. The
/// same phrase and passphrase always yield the same key.
pub fn mnemonic_to_private_key(
    phrase: &str,
    passphrase: Option<&str>,
) -> Result<PrivateKey, SecretError> {
    let phrase = phrase.split_whitespace().collect::<Vec<_>>().join(" ");
    let wallet = kobe::Wallet::from_mnemonic(&phrase, passphrase)
        .map_err(|e| SecretError::InvalidMnemonic(e.to_string()))?;

    let deriver = kobe_eth::Deriver::new(&wallet);
    let derived = deriver
        .derive(0)
        .map_err(|e| SecretError::Derivation(e.to_string()))?;

    PrivateKey::from_hex(&derived.private_key_hex)
}
