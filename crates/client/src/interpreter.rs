//! Interpreter plugins translating policy types into decisions.

use crate::{ClientSession, Decision};
use sentra_core::types::{PolicyResult, PolicyType};

/// Outcome of a usability probe on a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usability {
    /// False drops the entry from the cache.
    pub usable: bool,
    /// True replaces the cache's remembered session with the probing one.
    pub update_session: bool,
}

impl Usability {
    pub fn usable() -> Self {
        Self { usable: true, update_session: false }
    }

    pub fn stale() -> Self {
        Self { usable: false, update_session: false }
    }
}

/// A plugin answering for one or more policy types.
pub trait ClientInterpreter: Send + Sync {
    /// Types this plugin is registered for.
    fn supported_types(&self) -> Vec<PolicyType>;

    /// Whether `result` may be stored at all.
    fn is_cacheable(&self, session: &ClientSession, result: &PolicyResult) -> bool;

    /// Whether a stored `result` is still good for `session`, given the
    /// session the cache currently remembers.
    fn is_usable(
        &self,
        session: &ClientSession,
        prev_session: &ClientSession,
        result: &PolicyResult,
    ) -> Usability;

    /// Map a raw result to the final decision.
    fn to_decision(&self, session: &ClientSession, result: &PolicyResult) -> Decision;
}

/// Built-in interpreter for the predefined types: `ALLOW` is allowed,
/// everything else is denied; entries are always cacheable and usable.
#[derive(Debug, Default)]
pub struct NaiveInterpreter;

impl ClientInterpreter for NaiveInterpreter {
    fn supported_types(&self) -> Vec<PolicyType> {
        vec![PolicyType::ALLOW, PolicyType::DENY, PolicyType::NONE]
    }

    fn is_cacheable(&self, _session: &ClientSession, _result: &PolicyResult) -> bool {
        true
    }

    fn is_usable(
        &self,
        _session: &ClientSession,
        _prev_session: &ClientSession,
        _result: &PolicyResult,
    ) -> Usability {
        Usability::usable()
    }

    fn to_decision(&self, _session: &ClientSession, result: &PolicyResult) -> Decision {
        if result.policy_type == PolicyType::ALLOW {
            Decision::Allowed
        } else {
            Decision::Denied
        }
    }
}
