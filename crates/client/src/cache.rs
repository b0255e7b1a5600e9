//! Request-scoped decision cache with capacity eviction.
//!
//! Hits promote the entry in O(1), inserts past capacity evict the least
//! recently used entry, and a change of the caller-supplied session drops
//! everything. Interpreters registered per policy type decide cacheability,
//! usability and the final decision; results with no interpreter are never
//! stored and default to denied.

use crate::interpreter::{ClientInterpreter, NaiveInterpreter};
use crate::{ClientSession, Decision};
use lru::LruCache;
use sentra_core::limits::CACHE_DEFAULT_CAPACITY;
use sentra_core::types::{PolicyKey, PolicyResult, PolicyType};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

pub struct CapacityCache {
    session: ClientSession,
    entries: LruCache<String, PolicyResult>,
    interpreters: HashMap<PolicyType, Arc<dyn ClientInterpreter>>,
}

impl Default for CapacityCache {
    fn default() -> Self {
        Self::new(CACHE_DEFAULT_CAPACITY)
    }
}

impl CapacityCache {
    /// A cache holding at most `capacity` decisions, with the naive
    /// interpreter pre-registered for the predefined types.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let mut cache = Self {
            session: ClientSession::new(),
            entries: LruCache::new(capacity),
            interpreters: HashMap::new(),
        };
        cache.register_interpreter(Arc::new(NaiveInterpreter));
        cache
    }

    /// Register `interpreter` for every type it supports, replacing earlier
    /// registrations for those types.
    pub fn register_interpreter(&mut self, interpreter: Arc<dyn ClientInterpreter>) {
        for policy_type in interpreter.supported_types() {
            self.interpreters.insert(policy_type, Arc::clone(&interpreter));
        }
    }

    /// Look a key up. A hit is re-validated through its interpreter and
    /// promoted; a stale entry is removed and reported as a miss.
    pub fn get(&mut self, session: &ClientSession, key: &PolicyKey) -> Option<Decision> {
        let cache_key = Self::key_string(key);
        let result = self.entries.get(&cache_key)?.clone();
        let interpreter = match self.interpreters.get(&result.policy_type) {
            Some(i) => Arc::clone(i),
            None => {
                // An entry nothing can interpret anymore is dead weight.
                self.entries.pop(&cache_key);
                return None;
            }
        };
        let usability = interpreter.is_usable(session, &self.session, &result);
        if !usability.usable {
            debug!(%key, "cached decision no longer usable, dropping");
            self.entries.pop(&cache_key);
            return None;
        }
        if usability.update_session {
            self.session = session.clone();
        }
        Some(interpreter.to_decision(session, &result))
    }

    /// Store a fresh result and return its decision. Supplying a session
    /// different from the remembered one flushes the cache first.
    pub fn update(
        &mut self,
        session: &ClientSession,
        key: &PolicyKey,
        result: PolicyResult,
    ) -> Decision {
        if *session != self.session {
            debug!("session changed, flushing decision cache");
            self.entries.clear();
            self.session = session.clone();
        }
        let interpreter = self.interpreters.get(&result.policy_type).map(Arc::clone);
        match interpreter {
            Some(interpreter) => {
                if interpreter.is_cacheable(session, &result) {
                    self.entries.push(Self::key_string(key), result.clone());
                }
                interpreter.to_decision(session, &result)
            }
            None => Decision::Denied,
        }
    }

    /// Drop every entry and the remembered session. Registered interpreters
    /// survive.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.session = ClientSession::new();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Components cannot contain NUL (identifier grammar), so the joined
    // string is unambiguous.
    fn key_string(key: &PolicyKey) -> String {
        format!("{}\0{}\0{}", key.client, key.user, key.privilege)
    }
}
