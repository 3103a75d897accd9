#![forbid(unsafe_code)]

//! Token namespaces: property keys, labels and relationship types.

pub mod creator;
pub mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

pub use creator::{
    IsolatedTokenCreator, IsolatedUnit, MemoryTokenStore, TokenCreator, TokenStore,
    TokenStoreError,
};
pub use registry::{Token, TokenRegistry};

use crate::types::{CacheError, Result, TokenKind};

/// Counters shared by the token registries of one catalog.
#[derive(Default)]
pub struct TokenMetrics {
    resolve_calls: AtomicU64,
    resolve_hits: AtomicU64,
    resolve_misses: AtomicU64,
    create_calls: AtomicU64,
    tokens_created: AtomicU64,
}

/// Point-in-time copy of [`TokenMetrics`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TokenMetricsSnapshot {
    /// Name lookups, hit or miss.
    pub resolve_calls: u64,
    /// Lookups answered from the registry.
    pub resolve_hits: u64,
    /// Lookups that found no token.
    pub resolve_misses: u64,
    /// Calls into the token creator.
    pub create_calls: u64,
    /// Tokens the creator allocated.
    pub tokens_created: u64,
}

impl TokenMetricsSnapshot {
    /// Share of lookups that hit, or zero before the first lookup.
    pub fn resolve_hit_rate(&self) -> f64 {
        if self.resolve_calls == 0 {
            return 0.0;
        }
        self.resolve_hits as f64 / self.resolve_calls as f64
    }
}

impl TokenMetrics {
    /// Reads every counter.
    pub fn snapshot(&self) -> TokenMetricsSnapshot {
        TokenMetricsSnapshot {
            resolve_calls: self.resolve_calls.load(Ordering::Relaxed),
            resolve_hits: self.resolve_hits.load(Ordering::Relaxed),
            resolve_misses: self.resolve_misses.load(Ordering::Relaxed),
            create_calls: self.create_calls.load(Ordering::Relaxed),
            tokens_created: self.tokens_created.load(Ordering::Relaxed),
        }
    }

    fn inc(&self, counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn resolve(&self, hit: bool) {
        self.inc(&self.resolve_calls, 1);
        if hit {
            self.inc(&self.resolve_hits, 1);
        } else {
            self.inc(&self.resolve_misses, 1);
        }
    }

    fn created(&self, count: usize) {
        self.inc(&self.create_calls, 1);
        self.inc(&self.tokens_created, count as u64);
    }
}

/// Resolve-or-create front of one token namespace.
pub struct TokenHolder {
    kind: TokenKind,
    registry: TokenRegistry,
    creator: Arc<dyn TokenCreator>,
    create_lock: Mutex<()>,
    metrics: Arc<TokenMetrics>,
}

impl TokenHolder {
    /// Empty holder for `kind` backed by `creator`.
    pub fn new(kind: TokenKind, creator: Arc<dyn TokenCreator>) -> Self {
        Self {
            kind,
            registry: TokenRegistry::new(kind),
            creator,
            create_lock: Mutex::new(()),
            metrics: Arc::new(TokenMetrics::default()),
        }
    }

    /// Namespace served by this holder.
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// Shared counters.
    pub fn metrics(&self) -> Arc<TokenMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Current counter values.
    pub fn metrics_snapshot(&self) -> TokenMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Looks up the id of `name` without creating it.
    pub fn get_id_by_name(&self, name: &str) -> Option<u32> {
        let id = self.registry.get_id(name);
        self.metrics.resolve(id.is_some());
        id
    }

    /// Token registered under `id`.
    pub fn get_token_by_id(&self, id: u32) -> Option<Arc<Token>> {
        self.registry.get_token(id)
    }

    /// Every registered token, in id order.
    pub fn all_tokens(&self) -> Vec<Arc<Token>> {
        self.registry.all_tokens()
    }

    /// Publishes tokens read from the store.
    pub fn put_all(&self, tokens: Vec<Token>) -> Result<()> {
        self.registry.put_all(tokens)
    }

    /// Publishes one token read from the store.
    pub fn put(&self, token: Token) -> Result<()> {
        self.registry.put(token)
    }

    /// Resolves `name`, creating the token if it does not exist yet.
    pub fn get_or_create_id(&self, name: &str) -> Result<u32> {
        let ids = self.get_or_create_ids(&[name])?;
        ids.first()
            .copied()
            .ok_or(CacheError::Corruption("token batch resolved to nothing"))
    }

    /// Resolves every name, creating the missing ones in one creator call.
    ///
    /// Names are first resolved without locking. Whatever is still missing is
    /// resolved again under the create lock, then created once per distinct
    /// name. Tokens become visible only after the creator succeeded.
    pub fn get_or_create_ids(&self, names: &[&str]) -> Result<Vec<u32>> {
        let mut ids: Vec<Option<u32>> = names.iter().map(|name| self.get_id_by_name(name)).collect();
        if ids.iter().all(Option::is_some) {
            return Ok(ids.into_iter().flatten().collect());
        }

        let _create = self.create_lock.lock();
        let mut missing: Vec<String> = Vec::new();
        let mut missing_slots: FxHashMap<&str, usize> = FxHashMap::default();
        for (slot, name) in ids.iter_mut().zip(names) {
            if slot.is_some() {
                continue;
            }
            *slot = self.registry.get_id(name);
            if slot.is_none() && !missing_slots.contains_key(name) {
                missing_slots.insert(*name, missing.len());
                missing.push((*name).to_owned());
            }
        }

        if !missing.is_empty() {
            let created = self
                .creator
                .create(self.kind, &missing)
                .map_err(|source| CacheError::TokenCreation {
                    kind: self.kind,
                    names: missing.clone(),
                    source,
                })?;
            if created.len() != missing.len() {
                return Err(CacheError::Corruption(
                    "token creator returned a different number of ids",
                ));
            }
            let tokens = missing
                .iter()
                .zip(&created)
                .map(|(name, id)| Token::new(name.clone(), *id))
                .collect();
            self.registry.put_all(tokens)?;
            self.metrics.created(created.len());
            debug!(kind = self.kind.as_str(), count = created.len(), "catalog.token.create");
            for (slot, name) in ids.iter_mut().zip(names) {
                if slot.is_none() {
                    *slot = missing_slots.get(name).map(|idx| created[*idx]);
                }
            }
        }

        trace!(kind = self.kind.as_str(), names = names.len(), "catalog.token.resolve");
        ids.into_iter()
            .map(|id| id.ok_or(CacheError::Corruption("token left unresolved")))
            .collect()
    }
}
