//! Service-side interpreters for plugin-typed policy results.
//!
//! The decision engine hands plugin-typed results back uninterpreted; the
//! registry decides whether such a result can be answered directly or needs
//! an agent round-trip first.

use sentra_core::types::{PolicyDescription, PolicyKey, PolicyResult, PolicyType};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a service interpreter wants done with a plugin-typed result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Answer the client with this result immediately.
    Answer(PolicyResult),
    /// Park the check and consult the registered agent of `agent_type`.
    AskAgent { agent_type: String, data: Vec<u8> },
}

pub trait ServiceInterpreter: Send + Sync {
    /// Short name shown in description listings.
    fn name(&self) -> &str;

    fn supported_types(&self) -> Vec<PolicyType>;

    /// First pass over a plugin-typed result.
    fn check(&self, key: &PolicyKey, result: &PolicyResult) -> Verdict;

    /// Finalize a parked check from the agent's response payload.
    fn resolve(&self, key: &PolicyKey, result: &PolicyResult, agent_data: &[u8]) -> PolicyResult;
}

/// Interpreter that always defers to an external agent. The agent's payload
/// is the policy metadata; its one-byte answer (1 = allow) becomes the
/// final result.
pub struct AgentBackedInterpreter {
    name: String,
    policy_type: PolicyType,
    agent_type: String,
}

impl AgentBackedInterpreter {
    pub fn new(
        name: impl Into<String>,
        policy_type: PolicyType,
        agent_type: impl Into<String>,
    ) -> Self {
        Self { name: name.into(), policy_type, agent_type: agent_type.into() }
    }
}

impl ServiceInterpreter for AgentBackedInterpreter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_types(&self) -> Vec<PolicyType> {
        vec![self.policy_type]
    }

    fn check(&self, _key: &PolicyKey, result: &PolicyResult) -> Verdict {
        Verdict::AskAgent {
            agent_type: self.agent_type.clone(),
            data: result.metadata.as_bytes().to_vec(),
        }
    }

    fn resolve(
        &self,
        _key: &PolicyKey,
        _result: &PolicyResult,
        agent_data: &[u8],
    ) -> PolicyResult {
        if agent_data.first() == Some(&1) {
            PolicyResult::allow()
        } else {
            PolicyResult::deny()
        }
    }
}

/// Interpreters keyed by policy type. Plugins are plain values; registering
/// one for an already-covered type replaces the earlier entry.
#[derive(Default)]
pub struct PluginRegistry {
    interpreters: BTreeMap<PolicyType, Arc<dyn ServiceInterpreter>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, interpreter: Arc<dyn ServiceInterpreter>) {
        for policy_type in interpreter.supported_types() {
            self.interpreters.insert(policy_type, Arc::clone(&interpreter));
        }
    }

    pub fn get(&self, policy_type: PolicyType) -> Option<&Arc<dyn ServiceInterpreter>> {
        self.interpreters.get(&policy_type)
    }

    /// The predefined types plus every registered plugin type.
    pub fn descriptions(&self) -> Vec<PolicyDescription> {
        let mut out = vec![
            PolicyDescription::new(PolicyType::DENY, "deny"),
            PolicyDescription::new(PolicyType::NONE, "none"),
            PolicyDescription::new(PolicyType::BUCKET, "bucket"),
            PolicyDescription::new(PolicyType::ALLOW, "allow"),
        ];
        for (policy_type, interpreter) in &self.interpreters {
            out.push(PolicyDescription::new(*policy_type, interpreter.name()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lists_predefined_and_registered_types() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(AgentBackedInterpreter::new(
            "ask-user",
            PolicyType(0x0010),
            "popup",
        )));
        let descriptions = registry.descriptions();
        assert_eq!(descriptions.len(), 5);
        assert!(descriptions
            .iter()
            .any(|d| d.policy_type == PolicyType(0x0010) && d.name == "ask-user"));
    }

    #[test]
    fn agent_backed_round_trip() {
        let plugin = AgentBackedInterpreter::new("ask-user", PolicyType(0x0010), "popup");
        let key = PolicyKey::new("c", "u", "p");
        let raw = PolicyResult::new(PolicyType(0x0010), "prompt-text");
        match plugin.check(&key, &raw) {
            Verdict::AskAgent { agent_type, data } => {
                assert_eq!(agent_type, "popup");
                assert_eq!(data, b"prompt-text");
            }
            other => panic!("unexpected verdict {other:?}"),
        }
        assert_eq!(plugin.resolve(&key, &raw, &[1]), PolicyResult::allow());
        assert_eq!(plugin.resolve(&key, &raw, &[0]), PolicyResult::deny());
        assert_eq!(plugin.resolve(&key, &raw, &[]), PolicyResult::deny());
    }
}
