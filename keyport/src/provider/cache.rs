//! Read cache for repeated JSON-RPC calls.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;

/// Upper bound on stored results. When it is reached, block-scoped entries
/// are dropped first, then everything.
pub const MAX_ENTRIES: usize = 1024;

/// How long a method's result may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// The result never changes.
    Permanent,
    /// The result is valid until the next block.
    Block,
    /// Never cached.
    Never,
}

impl CachePolicy {
    /// Classify a JSON-RPC method.
    #[must_use]
    pub fn for_method(method: &str) -> Self {
        match method {
            "eth_chainId"
            | "net_version"
            | "eth_getTransactionByHash"
            | "eth_getTransactionReceipt"
            | "eth_getBlockByHash" => Self::Permanent,
            "eth_call"
            | "eth_getBalance"
            | "eth_getCode"
            | "eth_getTransactionCount"
            | "eth_getStorageAt"
            | "eth_estimateGas" => Self::Block,
            _ => Self::Never,
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    policy: CachePolicy,
}

/// Result cache keyed by method and serialized params.
///
/// `null` results are never stored, so pending receipts and missing blocks
/// are re-fetched.
#[derive(Debug, Default)]
pub struct ReadCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ReadCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(method: &str, params: &Value) -> String {
        format!("{method}:{params}")
    }

    /// Look up a cached result.
    #[must_use]
    pub fn get(&self, method: &str, params: &Value) -> Option<Value> {
        if CachePolicy::for_method(method) == CachePolicy::Never {
            return None;
        }
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&Self::key(method, params))
            .map(|entry| entry.value.clone())
    }

    /// Store a result if the method is cacheable.
    pub fn insert(&self, method: &str, params: &Value, value: &Value) {
        let policy = CachePolicy::for_method(method);
        if policy == CachePolicy::Never || value.is_null() {
            return;
        }
        let key = Self::key(method, params);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= MAX_ENTRIES && !entries.contains_key(&key) {
            entries.retain(|_, entry| entry.policy == CachePolicy::Permanent);
            if entries.len() >= MAX_ENTRIES {
                entries.clear();
            }
        }
        entries.insert(
            key,
            Entry {
                value: value.clone(),
                policy,
            },
        );
    }

    /// Drop every block-scoped entry.
    pub fn new_block(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| entry.policy == CachePolicy::Permanent);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of cached results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
