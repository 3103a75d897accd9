#![allow(missing_docs)]

use std::sync::{Arc, Barrier};
use std::thread;

use penumbra::primitives::ids::{IdGenerator, SequentialIds};
use penumbra::storage::catalog::{IsolatedTokenCreator, MemoryTokenStore, Token, TokenHolder};
use penumbra::storage::{CacheOptions, GraphKernel, MemoryStore};
use penumbra::types::{CacheError, Result, TokenKind};

fn holder(kind: TokenKind) -> (Arc<MemoryTokenStore>, Arc<TokenHolder>) {
    let store = Arc::new(MemoryTokenStore::new());
    let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIds::new());
    let creator = Arc::new(IsolatedTokenCreator::new(store.clone(), ids));
    (store, Arc::new(TokenHolder::new(kind, creator)))
}

#[test]
fn concurrent_requests_for_one_name_share_an_id() -> Result<()> {
    const THREADS: usize = 8;
    let (store, holder) = holder(TokenKind::Label);
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let holder = Arc::clone(&holder);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                holder.get_or_create_id("Person")
            })
        })
        .collect();
    let ids = handles
        .into_iter()
        .map(|handle| handle.join().expect("token thread"))
        .collect::<Result<Vec<_>>>()?;

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(holder.all_tokens().len(), 1);
    assert_eq!(store.tokens(TokenKind::Label), vec![Token::new("Person", ids[0])]);
    assert_eq!(store.commits(), 1);
    assert_eq!(holder.metrics_snapshot().tokens_created, 1);
    Ok(())
}

#[test]
fn duplicate_names_in_one_batch_collapse() -> Result<()> {
    let (store, holder) = holder(TokenKind::PropertyKey);
    let ids = holder.get_or_create_ids(&["a", "a", "b"])?;
    assert_eq!(ids.len(), 3);
    assert_eq!(ids[0], ids[1]);
    assert_ne!(ids[0], ids[2]);
    assert_eq!(store.tokens(TokenKind::PropertyKey).len(), 2);
    assert_eq!(store.commits(), 1);

    // Everything resolves without another creator call now.
    assert_eq!(holder.get_or_create_ids(&["b", "a"])?, vec![ids[2], ids[0]]);
    assert_eq!(store.commits(), 1);
    Ok(())
}

#[test]
fn failed_creation_publishes_nothing() -> Result<()> {
    let (store, holder) = holder(TokenKind::RelationshipType);
    store.fail_next_commits(1);
    let err = holder.get_or_create_ids(&["KNOWS", "LIKES"]).unwrap_err();
    match err {
        CacheError::TokenCreation { kind, names, .. } => {
            assert_eq!(kind, TokenKind::RelationshipType);
            assert_eq!(names, vec!["KNOWS".to_owned(), "LIKES".to_owned()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(holder.get_id_by_name("KNOWS"), None);
    assert!(holder.all_tokens().is_empty());
    assert!(store.tokens(TokenKind::RelationshipType).is_empty());

    let id = holder.get_or_create_id("KNOWS")?;
    assert_eq!(holder.get_token_by_id(id).map(|t| t.name().to_owned()), Some("KNOWS".into()));
    Ok(())
}

#[test]
fn conflicting_tokens_are_rejected() -> Result<()> {
    let (_store, holder) = holder(TokenKind::Label);
    holder.put_all(vec![Token::new("a", 1), Token::new("b", 2)])?;

    let err = holder.put(Token::new("a", 3)).unwrap_err();
    assert!(matches!(err, CacheError::NonUniqueToken { id: 3, .. }));
    let err = holder.put(Token::new("c", 2)).unwrap_err();
    assert!(matches!(err, CacheError::NonUniqueToken { ref name, .. } if name == "c"));
    // A batch with an internal clash is refused as a whole.
    assert!(holder
        .put_all(vec![Token::new("d", 4), Token::new("d", 5)])
        .is_err());
    assert_eq!(holder.get_id_by_name("d"), None);
    // Re-publishing an identical token is fine.
    holder.put(Token::new("a", 1))?;
    assert_eq!(holder.all_tokens().len(), 2);
    Ok(())
}

#[test]
fn kernel_reloads_persisted_tokens() -> Result<()> {
    let tokens = Arc::new(MemoryTokenStore::new());
    let first = {
        let store = Arc::new(MemoryStore::new(50));
        let kernel = GraphKernel::open(
            CacheOptions::default(),
            store.clone(),
            store,
            tokens.clone(),
        )?;
        kernel.get_or_create_id(TokenKind::Label, "Person")?
    };

    let store = Arc::new(MemoryStore::new(50));
    let kernel = GraphKernel::open(CacheOptions::default(), store.clone(), store, tokens)?;
    assert_eq!(kernel.get_id_by_name(TokenKind::Label, "Person"), Some(first));
    let second = kernel.get_or_create_id(TokenKind::Label, "Movie")?;
    assert!(second > first);
    assert_eq!(kernel.labels().all_tokens().len(), 2);
    assert_eq!(kernel.get_id_by_name(TokenKind::PropertyKey, "Person"), None);
    Ok(())
}
