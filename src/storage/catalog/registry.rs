use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::types::{CacheError, Result, TokenKind};

/// Immutable name/id pair of one token namespace.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Token {
    name: String,
    id: u32,
}

impl Token {
    /// Creates a token.
    pub fn new(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    /// Token name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token id.
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.id)
    }
}

/// Name/id maps of one token namespace.
///
/// Lookups take short read locks only. Publishing is serialized, checks the
/// whole batch before touching either map, and writes the id map before the
/// name map, so a name never resolves to an id without a token behind it.
pub struct TokenRegistry {
    kind: TokenKind,
    by_id: RwLock<FxHashMap<u32, Arc<Token>>>,
    by_name: RwLock<FxHashMap<String, u32>>,
    publish: Mutex<()>,
}

impl TokenRegistry {
    /// Creates an empty registry for `kind`.
    pub fn new(kind: TokenKind) -> Self {
        Self {
            kind,
            by_id: RwLock::new(FxHashMap::default()),
            by_name: RwLock::new(FxHashMap::default()),
            publish: Mutex::new(()),
        }
    }

    /// Namespace of the registry.
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// Resolves a name.
    pub fn get_id(&self, name: &str) -> Option<u32> {
        self.by_name.read().get(name).copied()
    }

    /// Resolves an id.
    pub fn get_token(&self, id: u32) -> Option<Arc<Token>> {
        self.by_id.read().get(&id).cloned()
    }

    /// Every published token, ordered by id.
    pub fn all_tokens(&self) -> Vec<Arc<Token>> {
        let mut tokens: Vec<_> = self.by_id.read().values().cloned().collect();
        tokens.sort_by_key(|token| token.id());
        tokens
    }

    /// Number of published tokens.
    pub fn len(&self) -> usize {
        self.by_id.read().len()
    }

    /// Whether no token is published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publishes one token.
    pub fn put(&self, token: Token) -> Result<()> {
        self.put_all(vec![token])
    }

    /// Publishes a batch of tokens, or none of them if any conflicts.
    ///
    /// Re-publishing an identical token is a no-op.
    pub fn put_all(&self, tokens: Vec<Token>) -> Result<()> {
        let _publish = self.publish.lock();
        {
            let by_id = self.by_id.read();
            let by_name = self.by_name.read();
            let mut batch_names: FxHashMap<&str, u32> = FxHashMap::default();
            let mut batch_ids: FxHashMap<u32, &str> = FxHashMap::default();
            for token in &tokens {
                let name_owner = by_name
                    .get(token.name())
                    .copied()
                    .or_else(|| batch_names.get(token.name()).copied());
                if let Some(existing) = name_owner {
                    if existing != token.id() {
                        return Err(self.non_unique(
                            token,
                            format!("name already maps to id {existing}"),
                        ));
                    }
                }
                let id_owner = by_id
                    .get(&token.id())
                    .map(|t| t.name())
                    .or_else(|| batch_ids.get(&token.id()).copied());
                if let Some(existing) = id_owner {
                    if existing != token.name() {
                        return Err(self.non_unique(
                            token,
                            format!("id already belongs to {existing:?}"),
                        ));
                    }
                }
                batch_names.insert(token.name(), token.id());
                batch_ids.insert(token.id(), token.name());
            }
        }
        let tokens: Vec<Arc<Token>> = tokens.into_iter().map(Arc::new).collect();
        {
            let mut by_id = self.by_id.write();
            for token in &tokens {
                by_id.insert(token.id(), Arc::clone(token));
            }
        }
        let mut by_name = self.by_name.write();
        for token in &tokens {
            by_name.insert(token.name().to_owned(), token.id());
        }
        Ok(())
    }

    fn non_unique(&self, token: &Token, conflict: String) -> CacheError {
        warn!(
            kind = self.kind.as_str(),
            name = token.name(),
            id = token.id(),
            %conflict,
            "catalog.token.non_unique"
        );
        CacheError::NonUniqueToken {
            kind: self.kind,
            name: token.name().to_owned(),
            id: token.id(),
            conflict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_publishes_both_directions() -> Result<()> {
        let registry = TokenRegistry::new(TokenKind::Label);
        registry.put(Token::new("Person", 0))?;
        registry.put(Token::new("Person", 0))?;
        assert_eq!(registry.get_id("Person"), Some(0));
        assert_eq!(registry.get_token(0).map(|t| t.name().to_owned()), Some("Person".into()));
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn conflicting_names_and_ids_are_fatal() -> Result<()> {
        let registry = TokenRegistry::new(TokenKind::PropertyKey);
        registry.put(Token::new("name", 1))?;
        let err = registry.put(Token::new("name", 2)).unwrap_err();
        assert!(matches!(err, CacheError::NonUniqueToken { id: 2, .. }));
        let err = registry.put(Token::new("age", 1)).unwrap_err();
        assert!(matches!(err, CacheError::NonUniqueToken { id: 1, .. }));
        Ok(())
    }

    #[test]
    fn failed_batch_publishes_nothing() {
        let registry = TokenRegistry::new(TokenKind::RelationshipType);
        let err = registry
            .put_all(vec![Token::new("KNOWS", 0), Token::new("LIKES", 0)])
            .unwrap_err();
        assert!(matches!(err, CacheError::NonUniqueToken { .. }));
        assert!(registry.is_empty());
        assert_eq!(registry.get_id("KNOWS"), None);
    }

    #[test]
    fn all_tokens_are_ordered_by_id() -> Result<()> {
        let registry = TokenRegistry::new(TokenKind::Label);
        registry.put_all(vec![Token::new("b", 5), Token::new("a", 2), Token::new("c", 9)])?;
        let ids: Vec<_> = registry.all_tokens().iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        Ok(())
    }
}
