//! Test doubles shared by unit tests.

#![allow(clippy::unwrap_used, missing_docs)]

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, Bytes};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::ChainId;
use crate::config::DeviceKind;
use crate::connector::{
    Activation, Connector, ConnectorKind, DeviceError, HardwareDevice, HardwareTransport,
    SessionApproval, SessionClient,
};
use crate::error::{ActivationError, Result, RpcError};
use crate::provider::{Eip1193, EventBus, EventStream, ProviderEvent, RpcTransport, SharedProvider, quantity};

/// Standard BIP-39 test phrase.
pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// Key at `m/44'/60'/0'/0/0` of [`TEST_MNEMONIC`].
pub const TEST_PRIVATE_KEY: &str = "1ab42cc412b618bdea3a599e3c9bae199ebf030895b039e9db1e30dafb12b727";

/// Checksummed address of [`TEST_PRIVATE_KEY`].
pub const TEST_ADDRESS: &str = "0x9858EfFD232B4033E47d90003D41EC34EcaEda94";

/// Second account used where two distinct addresses are needed.
pub const OTHER_ADDRESS: &str = "0x0000000000000000000000000000000000000001";

#[derive(Debug, Default)]
pub struct MockTransport {
    responses: Mutex<HashMap<String, Value>>,
    pub calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, method: &str, value: Value) {
        self.responses.lock().unwrap().insert(method.to_owned(), value);
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn request(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .ok_or_else(|| RpcError::unsupported_method(method))
    }
}

/// Scripted EIP-1193 provider.
#[derive(Debug, Default)]
pub struct MockProvider {
    responses: Mutex<HashMap<String, Result<Value, RpcError>>>,
    calls: Mutex<HashMap<String, usize>>,
    events: EventBus,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider that has already authorized `account` on `chain_id`.
    pub fn with_wallet(chain_id: ChainId, account: &str) -> Self {
        let mock = Self::new();
        mock.respond("eth_requestAccounts", json!([account]));
        mock.respond("eth_accounts", json!([account]));
        mock.respond("eth_chainId", quantity(chain_id));
        mock
    }

    pub fn respond(&self, method: &str, value: Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(method.to_owned(), Ok(value));
    }

    pub fn fail(&self, method: &str, err: RpcError) {
        self.responses
            .lock()
            .unwrap()
            .insert(method.to_owned(), Err(err));
    }

    /// Switch the wallet to another chain and announce it.
    pub fn switch_chain(&self, chain_id: ChainId) {
        self.respond("eth_chainId", quantity(chain_id));
        self.emit(ProviderEvent::ChainChanged(chain_id));
    }

    pub fn emit(&self, event: ProviderEvent) {
        self.events.emit(event);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    pub fn subscribers(&self) -> usize {
        self.events.subscriber_count()
    }
}

#[async_trait]
impl Eip1193 for MockProvider {
    async fn request(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(method.to_owned())
            .or_default() += 1;
        self.responses
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .unwrap_or_else(|| Err(RpcError::unsupported_method(method)))
    }

    fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }
}

/// Connector whose activations can be held open and released in any order.
#[derive(Debug)]
pub struct MockConnector {
    kind: ConnectorKind,
    pub provider: Arc<MockProvider>,
    account: Address,
    chain_id: AtomicU64,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    failure: Mutex<Option<ActivationError>>,
    active: AtomicBool,
    pub activations: AtomicUsize,
    pub deactivations: AtomicUsize,
}

impl MockConnector {
    pub fn new(kind: ConnectorKind, chain_id: ChainId, account: &str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            provider: Arc::new(MockProvider::with_wallet(chain_id, account)),
            account: account.parse().unwrap(),
            chain_id: AtomicU64::new(chain_id),
            gate: Mutex::new(None),
            failure: Mutex::new(None),
            active: AtomicBool::new(false),
            activations: AtomicUsize::new(0),
            deactivations: AtomicUsize::new(0),
        })
    }

    /// Hold the next activation until the returned sender fires.
    pub fn hold(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Fail the next activation with `err`.
    pub fn fail_next(&self, err: ActivationError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    /// Report `chain_id` from now on and announce the switch.
    pub fn switch_chain(&self, chain_id: ChainId) {
        self.chain_id.store(chain_id, Ordering::SeqCst);
        self.provider.switch_chain(chain_id);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn kind(&self) -> ConnectorKind {
        self.kind
    }

    async fn activate(&self) -> Result<Activation> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let failure = self.failure.lock().unwrap().take();
        if let Some(err) = failure {
            return Err(err);
        }
        self.active.store(true, Ordering::SeqCst);
        let provider: SharedProvider = self.provider.clone();
        Ok(Activation {
            provider,
            chain_id: self.chain_id.load(Ordering::SeqCst),
        })
    }

    async fn account(&self) -> Result<Address> {
        Ok(self.account)
    }

    async fn chain_id(&self) -> Result<ChainId> {
        Ok(self.chain_id.load(Ordering::SeqCst))
    }

    async fn provider(&self) -> Result<SharedProvider> {
        let provider: SharedProvider = self.provider.clone();
        Ok(provider)
    }

    async fn deactivate(&self) {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct DeviceState {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub signed: AtomicUsize,
    unplugged: AtomicBool,
    rejecting: AtomicBool,
}

/// Hardware transport and device in one.
#[derive(Debug, Clone)]
pub struct MockDevice {
    address: Address,
    state: Arc<DeviceState>,
}

impl MockDevice {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.parse().unwrap(),
            state: Arc::default(),
        }
    }

    pub fn unplug(&self) {
        self.state.unplugged.store(true, Ordering::SeqCst);
    }

    pub fn reject_requests(&self) {
        self.state.rejecting.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DeviceError> {
        if self.state.unplugged.load(Ordering::SeqCst) {
            return Err(DeviceError::Unreachable("no device found".to_owned()));
        }
        if self.state.rejecting.load(Ordering::SeqCst) {
            return Err(DeviceError::Rejected);
        }
        Ok(())
    }
}

impl Deref for MockDevice {
    type Target = DeviceState;

    fn deref(&self) -> &DeviceState {
        &self.state
    }
}

#[async_trait]
impl HardwareTransport for MockDevice {
    async fn open(&self, _kind: DeviceKind) -> Result<Arc<dyn HardwareDevice>, DeviceError> {
        if self.state.unplugged.load(Ordering::SeqCst) {
            return Err(DeviceError::Unreachable("no device found".to_owned()));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl HardwareDevice for MockDevice {
    async fn address(&self, _path: &str) -> Result<Address, DeviceError> {
        self.check()?;
        Ok(self.address)
    }

    async fn sign_personal_message(&self, _path: &str, _message: &[u8]) -> Result<Bytes, DeviceError> {
        self.check()?;
        self.state.signed.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from(vec![0x11; 65]))
    }

    async fn close(&self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Relay client double. Killing the session makes the provider report
/// `Disconnect`, as a real relay does.
#[derive(Debug)]
pub struct MockSessionClient {
    pub provider: Arc<MockProvider>,
    approval: Result<SessionApproval, RpcError>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub disconnects: AtomicUsize,
}

impl MockSessionClient {
    pub fn new(chain_id: ChainId, account: &str) -> Arc<Self> {
        Arc::new(Self::build(chain_id, account, None))
    }

    /// Approval waits until the returned sender fires.
    pub fn gated(chain_id: ChainId, account: &str) -> (Arc<Self>, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        (Arc::new(Self::build(chain_id, account, Some(rx))), tx)
    }

    pub fn rejecting() -> Arc<Self> {
        let mut client = Self::build(1, TEST_ADDRESS, None);
        client.approval = Err(RpcError::user_rejected());
        Arc::new(client)
    }

    fn build(chain_id: ChainId, account: &str, gate: Option<oneshot::Receiver<()>>) -> Self {
        Self {
            provider: Arc::new(MockProvider::with_wallet(chain_id, account)),
            approval: Ok(SessionApproval {
                accounts: vec![account.parse().unwrap()],
                chain_id,
            }),
            gate: Mutex::new(gate),
            disconnects: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionClient for MockSessionClient {
    async fn pair(&self, chain_id: ChainId) -> Result<String, RpcError> {
        Ok(format!("wc:00e46b69-d0cc-4b3e-b6a2-cee442f97188@1?bridge=https%3A%2F%2Fbridge.example&key=91303dedf64285cbbaf9120f6e9d160a5de2be1c5d8e5c1f6e0b0c7b8a6d9e4f&chainId={chain_id}"))
    }

    async fn approval(&self) -> Result<SessionApproval, RpcError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.approval.clone()
    }

    fn provider(&self) -> SharedProvider {
        let provider: SharedProvider = self.provider.clone();
        provider
    }

    async fn disconnect(&self) -> Result<(), RpcError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.provider.emit(ProviderEvent::Disconnect);
        Ok(())
    }
}
