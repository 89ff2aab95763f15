//! # Identity Keystore
//!
//! Per-in-flight-object correlation state: stash at the stage that opens an
//! identity, update at interim stages, delete at the stage that closes it.
//!
//! Raw kernel handles are only trusted for one object's lifetime. Every entry
//! is bound to a synthetic [`Token`] drawn from a session-wide
//! [`TokenAllocator`]; opening a handle that still has a live entry replaces
//! that entry with a fresh token so a recycled address never inherits
//! another object's state.
//!
//! Entries live in a [`DashMap`], so different identities can be mutated
//! concurrently without a global lock while updates to a single identity stay
//! atomic.

use dashmap::DashMap;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::domain::{Handle, KeystoreError, Token};

/// Observable stages that carry a timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Vfs = 0,
    PageCache,
    ReadPage,
    Ext4ReadPage,
    Ext4Write,
    WritePage,
    Ext4Sync,
    BlockEntry,
    SplitEntry,
    MergeEntry,
    RequestCreate,
    RequestIssue,
}

impl Stage {
    pub const COUNT: usize = 12;

    fn index(self) -> usize {
        self as usize
    }
}

/// Stage → nanosecond timestamp for one identity
///
/// An absent stage is `None`. Setting a stage twice keeps the most recent
/// timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTimestamps([Option<u64>; Stage::COUNT]);

impl StageTimestamps {
    pub fn set(&mut self, stage: Stage, ts: u64) {
        self.0[stage.index()] = Some(ts);
    }

    #[must_use]
    pub fn get(&self, stage: Stage) -> Option<u64> {
        self.0[stage.index()]
    }

    /// Timestamp or 0 when the stage never fired
    #[must_use]
    pub fn get_or_zero(&self, stage: Stage) -> u64 {
        self.get(stage).unwrap_or(0)
    }

    /// Clear `stage`, returning its timestamp
    pub fn take(&mut self, stage: Stage) -> Option<u64> {
        self.0[stage.index()].take()
    }
}

/// Keystore values that expose their stage timestamps
pub trait Stamped {
    fn stamps(&self) -> &StageTimestamps;
    fn stamps_mut(&mut self) -> &mut StageTimestamps;
}

impl Stamped for StageTimestamps {
    fn stamps(&self) -> &StageTimestamps {
        self
    }

    fn stamps_mut(&mut self) -> &mut StageTimestamps {
        self
    }
}

/// Session-wide source of never-reused tokens
#[derive(Debug)]
pub struct TokenAllocator {
    next: AtomicU64,
}

impl TokenAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    pub fn allocate(&self) -> Token {
        Token(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TokenAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A live keystore entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<V> {
    pub token: Token,
    pub value: V,
}

/// Handle → correlation state for one identity scope
pub struct Keystore<K: Handle, V> {
    scope: &'static str,
    entries: DashMap<K, Entry<V>>,
    tokens: Arc<TokenAllocator>,
}

impl<K: Handle, V> Keystore<K, V> {
    #[must_use]
    pub fn new(scope: &'static str, tokens: Arc<TokenAllocator>) -> Self {
        Self { scope, entries: DashMap::new(), tokens }
    }

    /// Scope name used in diagnostics
    #[must_use]
    pub fn scope(&self) -> &'static str {
        self.scope
    }

    /// Open a fresh entry for `handle`, replacing any stale one
    pub fn open(&self, handle: K, value: V) -> Token {
        let token = self.tokens.allocate();
        if let Some(stale) = self.entries.insert(handle, Entry { token, value }) {
            debug!(
                "{}: handle {:#x} reopened while {} was live, replaced by {}",
                self.scope,
                handle.raw(),
                stale.token,
                token
            );
        }
        token
    }

    /// Mutate the live entry for `handle`
    ///
    /// # Errors
    /// Returns [`KeystoreError::NotFound`] when `handle` has no live entry
    pub fn update<R>(&self, handle: K, f: impl FnOnce(&mut V) -> R) -> Result<R, KeystoreError> {
        match self.entries.get_mut(&handle) {
            Some(mut entry) => Ok(f(&mut entry.value)),
            None => Err(self.not_found(handle)),
        }
    }

    /// Token bound to the live entry for `handle`
    ///
    /// # Errors
    /// Returns [`KeystoreError::NotFound`] when `handle` has no live entry
    pub fn token(&self, handle: K) -> Result<Token, KeystoreError> {
        self.entries.get(&handle).map(|entry| entry.token).ok_or_else(|| self.not_found(handle))
    }

    /// Remove and return all state for `handle`
    ///
    /// # Errors
    /// Returns [`KeystoreError::NotFound`] when `handle` has no live entry
    pub fn delete(&self, handle: K) -> Result<Entry<V>, KeystoreError> {
        self.entries.remove(&handle).map(|(_, entry)| entry).ok_or_else(|| self.not_found(handle))
    }

    #[must_use]
    pub fn contains(&self, handle: K) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discard every live entry (session reset)
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn not_found(&self, handle: K) -> KeystoreError {
        KeystoreError::NotFound { scope: self.scope, handle: handle.raw() }
    }
}

impl<K: Handle, V: Clone> Keystore<K, V> {
    /// Snapshot of the live entry for `handle`
    ///
    /// # Errors
    /// Returns [`KeystoreError::NotFound`] when `handle` has no live entry
    pub fn lookup(&self, handle: K) -> Result<Entry<V>, KeystoreError> {
        self.entries.get(&handle).map(|entry| entry.value().clone()).ok_or_else(|| self.not_found(handle))
    }
}

impl<K: Handle, V: Stamped + Default> Keystore<K, V> {
    /// Record or overwrite the timestamp of `stage` for `handle`
    ///
    /// Creates the entry when `handle` has none. Repeated firings of the same
    /// stage keep the most recent timestamp.
    pub fn put(&self, handle: K, stage: Stage, ts: u64) -> Token {
        let mut entry = self
            .entries
            .entry(handle)
            .or_insert_with(|| Entry { token: self.tokens.allocate(), value: V::default() });
        entry.value.stamps_mut().set(stage, ts);
        entry.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ObjectHandle, ThreadHandle};

    fn store() -> Keystore<ObjectHandle, StageTimestamps> {
        Keystore::new("request", Arc::new(TokenAllocator::new()))
    }

    #[test]
    fn test_put_delete_lookup_is_not_found() {
        let store = store();
        for raw in [1u64, 0xffff_8880_0000_1000, u64::MAX] {
            let handle = ObjectHandle(raw);
            store.put(handle, Stage::RequestCreate, 100);
            assert!(store.delete(handle).is_ok());
            assert_eq!(
                store.lookup(handle),
                Err(KeystoreError::NotFound { scope: "request", handle: raw })
            );
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_last_write_wins() {
        let store = store();
        let handle = ObjectHandle(0x1000);
        let first = store.put(handle, Stage::RequestIssue, 10);
        let second = store.put(handle, Stage::RequestIssue, 25);

        assert_eq!(first, second);
        let entry = store.lookup(handle).unwrap();
        assert_eq!(entry.value.get(Stage::RequestIssue), Some(25));
        assert_eq!(entry.value.get(Stage::RequestCreate), None);
    }

    #[test]
    fn test_open_replaces_stale_entry_with_fresh_token() {
        let store = store();
        let handle = ObjectHandle(0x2000);
        store.put(handle, Stage::RequestIssue, 7);
        let stale = store.token(handle).unwrap();

        let fresh = store.open(handle, StageTimestamps::default());

        assert!(fresh > stale);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup(handle).unwrap().value.get(Stage::RequestIssue), None);
    }

    #[test]
    fn test_tokens_never_reused_across_scopes() {
        let tokens = Arc::new(TokenAllocator::new());
        let requests: Keystore<ObjectHandle, StageTimestamps> =
            Keystore::new("request", Arc::clone(&tokens));
        let threads: Keystore<ThreadHandle, StageTimestamps> = Keystore::new("syscall", tokens);

        let a = requests.open(ObjectHandle(1), StageTimestamps::default());
        requests.delete(ObjectHandle(1)).unwrap();
        let b = threads.open(ThreadHandle(1), StageTimestamps::default());
        let c = requests.open(ObjectHandle(1), StageTimestamps::default());

        assert!(a < b && b < c);
    }

    #[test]
    fn test_update_missing_entry() {
        let store = store();
        let result = store.update(ObjectHandle(9), |stamps| stamps.set(Stage::RequestIssue, 1));
        assert!(result.is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete_twice_fails_second_time() {
        let store = store();
        store.put(ObjectHandle(3), Stage::RequestCreate, 1);
        assert!(store.delete(ObjectHandle(3)).is_ok());
        assert!(store.delete(ObjectHandle(3)).is_err());
    }

    #[test]
    fn test_concurrent_distinct_identities() {
        let store = store();
        std::thread::scope(|scope| {
            for cpu in 0..4u64 {
                let store = &store;
                scope.spawn(move || {
                    for i in 0..250u64 {
                        let handle = ObjectHandle(cpu * 1_000 + i + 1);
                        store.put(handle, Stage::RequestCreate, i);
                        store.put(handle, Stage::RequestIssue, i + 1);
                    }
                });
            }
        });
        assert_eq!(store.len(), 1_000);

        store.clear();
        assert!(store.is_empty());
    }
}
