//! Token persistence in isolated units of work.
//!
//! A token must survive even if the transaction that first asked for it rolls
//! back, so creation never joins the caller's transaction. Instead the creator
//! opens an explicit [`IsolatedUnit`] against the token store, fills it and
//! commits it on its own.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::primitives::ids::{IdGenerator, IdKind};
use crate::storage::catalog::registry::Token;
use crate::types::{BoxError, TokenKind};

/// Persists new tokens.
pub trait TokenCreator: Send + Sync {
    /// Creates one token per name in a single isolated unit of work.
    ///
    /// Returns the new ids in the order of `names`. Nothing is persisted
    /// when the call fails.
    fn create(&self, kind: TokenKind, names: &[String]) -> Result<Vec<u32>, BoxError>;
}

/// Fresh write context detached from any caller transaction.
#[derive(Debug)]
pub struct IsolatedUnit {
    id: u64,
    writes: Vec<(TokenKind, Token)>,
}

impl IsolatedUnit {
    /// Opens an empty unit.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            writes: Vec::new(),
        }
    }

    /// Unit id assigned by the store.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stages a token write.
    pub fn write_token(&mut self, kind: TokenKind, token: Token) {
        self.writes.push((kind, token));
    }

    /// Staged writes in order.
    pub fn writes(&self) -> &[(TokenKind, Token)] {
        &self.writes
    }

    /// Takes the staged writes.
    pub fn into_writes(self) -> Vec<(TokenKind, Token)> {
        self.writes
    }
}

/// Durable home of tokens.
pub trait TokenStore: Send + Sync {
    /// Opens a new isolated unit of work.
    fn begin_isolated(&self) -> Result<IsolatedUnit, BoxError>;

    /// Makes every write of `unit` durable, or none of them.
    fn commit(&self, unit: IsolatedUnit) -> Result<(), BoxError>;

    /// Every persisted token of `kind`, for the initial registry load.
    fn load_tokens(&self, kind: TokenKind) -> Result<Vec<Token>, BoxError>;
}

/// [`TokenCreator`] running each call in its own [`IsolatedUnit`].
pub struct IsolatedTokenCreator<S: TokenStore> {
    store: Arc<S>,
    ids: Arc<dyn IdGenerator>,
}

impl<S: TokenStore> IsolatedTokenCreator<S> {
    /// Creates a creator writing to `store` with ids from `ids`.
    pub fn new(store: Arc<S>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { store, ids }
    }
}

impl<S: TokenStore> TokenCreator for IsolatedTokenCreator<S> {
    fn create(&self, kind: TokenKind, names: &[String]) -> Result<Vec<u32>, BoxError> {
        let mut unit = self.store.begin_isolated()?;
        let mut created = Vec::with_capacity(names.len());
        for name in names {
            let raw = self.ids.next_id(IdKind::Token(kind));
            let id = u32::try_from(raw).map_err(|_| TokenStoreError::IdSpaceExhausted(kind))?;
            unit.write_token(kind, Token::new(name.clone(), id));
            created.push(id);
        }
        let unit_id = unit.id();
        self.store.commit(unit)?;
        debug!(kind = kind.as_str(), unit = unit_id, count = created.len(), "catalog.token.persisted");
        Ok(created)
    }
}

/// Errors raised by [`MemoryTokenStore`] and [`IsolatedTokenCreator`].
#[derive(thiserror::Error, Debug)]
pub enum TokenStoreError {
    /// The unit was refused at commit.
    #[error("isolated unit {0} failed to commit")]
    CommitFailed(u64),
    /// No more ids fit the token id width.
    #[error("{0} id space exhausted")]
    IdSpaceExhausted(TokenKind),
}

/// In-memory [`TokenStore`] with commit fault injection.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<FxHashMap<TokenKind, Vec<Token>>>,
    next_unit: AtomicU64,
    failing_commits: AtomicUsize,
    commits: AtomicU64,
}

impl MemoryTokenStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Number of successful commits.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Persisted tokens of `kind` in write order.
    pub fn tokens(&self, kind: TokenKind) -> Vec<Token> {
        self.tokens.lock().get(&kind).cloned().unwrap_or_default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn begin_isolated(&self) -> Result<IsolatedUnit, BoxError> {
        Ok(IsolatedUnit::new(self.next_unit.fetch_add(1, Ordering::SeqCst)))
    }

    fn commit(&self, unit: IsolatedUnit) -> Result<(), BoxError> {
        let failing = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Box::new(TokenStoreError::CommitFailed(unit.id())));
        }
        let mut tokens = self.tokens.lock();
        for (kind, token) in unit.into_writes() {
            tokens.entry(kind).or_default().push(token);
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_tokens(&self, kind: TokenKind) -> Result<Vec<Token>, BoxError> {
        Ok(self.tokens(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::ids::SequentialIds;

    fn creator() -> (Arc<MemoryTokenStore>, IsolatedTokenCreator<MemoryTokenStore>) {
        let store = Arc::new(MemoryTokenStore::new());
        let creator = IsolatedTokenCreator::new(Arc::clone(&store), Arc::new(SequentialIds::new()));
        (store, creator)
    }

    #[test]
    fn one_call_is_one_unit() {
        let (store, creator) = creator();
        let ids = creator
            .create(TokenKind::Label, &["A".into(), "B".into()])
            .unwrap();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(store.commits(), 1);
        assert_eq!(store.tokens(TokenKind::Label).len(), 2);
        assert!(store.tokens(TokenKind::PropertyKey).is_empty());
    }

    #[test]
    fn failed_unit_persists_nothing() {
        let (store, creator) = creator();
        store.fail_next_commits(1);
        assert!(creator.create(TokenKind::Label, &["A".into()]).is_err());
        assert!(store.tokens(TokenKind::Label).is_empty());
        assert!(creator.create(TokenKind::Label, &["A".into()]).is_ok());
        assert_eq!(store.tokens(TokenKind::Label).len(), 1);
    }
}
