//! Common imports.

pub use crate::ChainId;
pub use crate::config::{
    ConnectorConfig, CoordinatorConfig, DeviceKind, DeviceManifest, HardwareConfig,
    RemoteSessionConfig,
};
pub use crate::connector::{
    Activation, Connector, ConnectorKind, HardwareConnector, InjectedConnector,
    RawSecretConnector, RemoteSessionConnector, SharedConnector,
};
pub use crate::coordinator::{
    ActivationCoordinator, ActivationOutcome, ActivationSnapshot, ActivationStatus,
    InactiveListener,
};
pub use crate::error::{ActivationError, RpcError};
pub use crate::provider::{ChainClient, Eip1193, ProviderEvent, SharedProvider};
pub use crate::secret::{PrivateKey, keystore_to_private_key_str, mnemonic_to_private_key};
