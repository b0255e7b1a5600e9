//! Sentra core primitives and shared types.

#![deny(unsafe_code)]

/// Version of the sentra core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod limits {
    //! Process-wide limits shared by every component.

    /// Longest accepted client/user/privilege identifier, in bytes.
    pub const MAX_ID_LENGTH: usize = 1024;

    /// Longest accepted bucket id, in bytes.
    pub const MAX_BUCKET_ID_LENGTH: usize = 256;

    /// Default capacity of the client-library decision cache.
    pub const CACHE_DEFAULT_CAPACITY: usize = 10_000;

    /// Default capacity of the daemon monitor entry buffer.
    pub const MONITOR_DEFAULT_BUFFER_SIZE: usize = 100;
}

pub mod paths {
    //! Well-known local socket endpoints.

    /// Socket accepting client checks and agent registrations.
    pub const CLIENT_SOCKET: &str = "/run/sentra/sentra.socket";

    /// Socket accepting privileged admin operations.
    pub const ADMIN_SOCKET: &str = "/run/sentra/sentra-admin.socket";
}

pub mod time {
    //! Timestamp helper for monitor entries and diagnostics.

    use std::time::{SystemTime, UNIX_EPOCH};

    /// Milliseconds since UNIX epoch.
    pub fn now_ms() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }
}

pub mod types {
    //! Policy data model: keys, types, results, buckets.

    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;
    use std::fmt;

    /// The single wildcard token accepted in key components.
    pub const WILDCARD: &str = "*";

    /// Identifier of a policy bucket. The empty string names the root bucket.
    pub type PolicyBucketId = String;

    /// Id of the root bucket.
    pub const ROOT_BUCKET: &str = "";

    /// 16-bit policy type tag.
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    pub struct PolicyType(pub u16);

    impl PolicyType {
        /// Deny the request.
        pub const DENY: PolicyType = PolicyType(0x0000);
        /// Bucket default only; fall through with no decision.
        pub const NONE: PolicyType = PolicyType(0x0001);
        /// Redirect evaluation to the bucket named by the metadata.
        pub const BUCKET: PolicyType = PolicyType(0xFFFE);
        /// Allow the request.
        pub const ALLOW: PolicyType = PolicyType(0xFFFF);

        /// Whether this is one of the four reserved predefined types.
        pub fn is_predefined(self) -> bool {
            matches!(self, Self::DENY | Self::NONE | Self::BUCKET | Self::ALLOW)
        }

        /// Whether this tag falls in the plugin-interpreted range.
        pub fn is_plugin(self) -> bool {
            !self.is_predefined()
        }
    }

    impl fmt::Display for PolicyType {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "0x{:04x}", self.0)
        }
    }

    /// A (client, user, privilege) triple. Components are literal strings or
    /// the `*` wildcard; equality is component-wise and literal.
    #[derive(
        Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    pub struct PolicyKey {
        pub client: String,
        pub user: String,
        pub privilege: String,
    }

    impl PolicyKey {
        pub fn new(
            client: impl Into<String>,
            user: impl Into<String>,
            privilege: impl Into<String>,
        ) -> Self {
            Self { client: client.into(), user: user.into(), privilege: privilege.into() }
        }

        /// The fully-wildcarded key `(*, *, *)`.
        pub fn any() -> Self {
            Self::new(WILDCARD, WILDCARD, WILDCARD)
        }

        /// Whether this key, read as a pattern, covers `query`. A component
        /// covers when it is the wildcard or equals the query component.
        pub fn matches(&self, query: &PolicyKey) -> bool {
            fn covers(pattern: &str, literal: &str) -> bool {
                pattern == WILDCARD || pattern == literal
            }
            covers(&self.client, &query.client)
                && covers(&self.user, &query.user)
                && covers(&self.privilege, &query.privilege)
        }

        /// Number of non-wildcard components; higher is more specific.
        pub fn specificity(&self) -> u8 {
            [&self.client, &self.user, &self.privilege]
                .iter()
                .filter(|c| c.as_str() != WILDCARD)
                .count() as u8
        }
    }

    impl fmt::Display for PolicyKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "({};{};{})", self.client, self.user, self.privilege)
        }
    }

    /// Outcome of a policy lookup: a type tag plus opaque metadata. For
    /// `BUCKET` the metadata names the target bucket; for plugin types it is
    /// payload carried verbatim to the interpreter.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PolicyResult {
        pub policy_type: PolicyType,
        pub metadata: String,
    }

    impl PolicyResult {
        pub fn new(policy_type: PolicyType, metadata: impl Into<String>) -> Self {
            Self { policy_type, metadata: metadata.into() }
        }

        pub fn allow() -> Self {
            Self::new(PolicyType::ALLOW, "")
        }

        pub fn deny() -> Self {
            Self::new(PolicyType::DENY, "")
        }

        pub fn none() -> Self {
            Self::new(PolicyType::NONE, "")
        }

        /// Redirect to `bucket`.
        pub fn bucket(bucket: impl Into<String>) -> Self {
            Self::new(PolicyType::BUCKET, bucket)
        }
    }

    /// A (key -> result) binding owned by exactly one bucket.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Policy {
        pub key: PolicyKey,
        pub result: PolicyResult,
    }

    impl Policy {
        pub fn new(key: PolicyKey, result: PolicyResult) -> Self {
            Self { key, result }
        }
    }

    /// A named set of policies plus a default result. Policies are indexed by
    /// key; the map ordering doubles as the deterministic tie-break order.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PolicyBucket {
        pub id: PolicyBucketId,
        pub default_result: PolicyResult,
        pub policies: BTreeMap<PolicyKey, PolicyResult>,
    }

    impl PolicyBucket {
        pub fn new(id: impl Into<PolicyBucketId>, default_result: PolicyResult) -> Self {
            Self { id: id.into(), default_result, policies: BTreeMap::new() }
        }

        /// Insert or replace the policy with `policy.key`.
        pub fn set_policy(&mut self, policy: Policy) {
            self.policies.insert(policy.key, policy.result);
        }

        /// Remove the policy with `key`; true when one was present.
        pub fn remove_policy(&mut self, key: &PolicyKey) -> bool {
            self.policies.remove(key).is_some()
        }
    }

    /// Human-readable description of a supported policy type.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PolicyDescription {
        pub policy_type: PolicyType,
        pub name: String,
    }

    impl PolicyDescription {
        pub fn new(policy_type: PolicyType, name: impl Into<String>) -> Self {
            Self { policy_type, name: name.into() }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn wildcard_covers_literals() {
            let pattern = PolicyKey::new("*", "user", "*");
            assert!(pattern.matches(&PolicyKey::new("app", "user", "camera")));
            assert!(!pattern.matches(&PolicyKey::new("app", "other", "camera")));
        }

        #[test]
        fn literal_wildcard_query_needs_literal_wildcard_pattern() {
            // A query component "*" is matched literally, not expanded.
            let pattern = PolicyKey::new("app", "user", "camera");
            assert!(!pattern.matches(&PolicyKey::new("*", "user", "camera")));
            assert!(PolicyKey::any().matches(&PolicyKey::new("*", "user", "camera")));
        }

        #[test]
        fn specificity_counts_non_wildcards() {
            assert_eq!(PolicyKey::any().specificity(), 0);
            assert_eq!(PolicyKey::new("a", "*", "*").specificity(), 1);
            assert_eq!(PolicyKey::new("a", "b", "c").specificity(), 3);
        }

        #[test]
        fn predefined_type_partition() {
            assert!(PolicyType::DENY.is_predefined());
            assert!(PolicyType::BUCKET.is_predefined());
            assert!(PolicyType(0x0002).is_plugin());
            assert!(PolicyType(0xABCD).is_plugin());
        }

        #[test]
        fn key_ordering_is_lexicographic_on_the_triple() {
            let a = PolicyKey::new("a", "z", "z");
            let b = PolicyKey::new("b", "a", "a");
            assert!(a < b);
        }
    }
}

pub mod validation {
    //! Identifier and bucket-id grammar checks.

    use crate::limits::{MAX_BUCKET_ID_LENGTH, MAX_ID_LENGTH};
    use once_cell::sync::Lazy;
    use regex::Regex;
    use thiserror::Error;

    #[derive(Debug, Error, PartialEq, Eq)]
    pub enum ValidationError {
        #[error("invalid bucket id {0:?}")]
        InvalidBucketId(String),
        #[error("identifier exceeds {MAX_ID_LENGTH} bytes ({0} given)")]
        IdentifierTooLong(usize),
        #[error("invalid identifier {0:?}")]
        InvalidIdentifier(String),
    }

    // Printable ASCII without ';' (the on-disk field separator). The two
    // ranges are 0x20-0x3a and 0x3c-0x7e.
    static BUCKET_ID: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^[ -:<-~]*$").expect("bucket id pattern"));

    /// Check a bucket id against the grammar: printable subset, no `;`, no
    /// control bytes, bounded length.
    pub fn validate_bucket_id(id: &str) -> Result<(), ValidationError> {
        if id.len() > MAX_BUCKET_ID_LENGTH || !BUCKET_ID.is_match(id) {
            return Err(ValidationError::InvalidBucketId(id.to_owned()));
        }
        Ok(())
    }

    /// Check a key component (client, user or privilege): bounded length,
    /// no control bytes, no `;` (the persisted-record field separator).
    pub fn validate_identifier(id: &str) -> Result<(), ValidationError> {
        if id.len() > MAX_ID_LENGTH {
            return Err(ValidationError::IdentifierTooLong(id.len()));
        }
        if id.chars().any(|c| c == ';' || c.is_control()) {
            return Err(ValidationError::InvalidIdentifier(id.to_owned()));
        }
        Ok(())
    }

    /// Check every component of a key.
    pub fn validate_key(key: &crate::types::PolicyKey) -> Result<(), ValidationError> {
        validate_identifier(&key.client)?;
        validate_identifier(&key.user)?;
        validate_identifier(&key.privilege)
    }

}

pub mod api {
    //! Stable integer return codes of the client and admin API surfaces.

    pub const SUCCESS: i32 = 0;
    pub const ACCESS_DENIED: i32 = -1;
    pub const OUT_OF_MEMORY: i32 = -2;
    pub const INVALID_PARAM: i32 = -3;
    pub const SERVICE_NOT_AVAILABLE: i32 = -4;

    /// Admin-specific extensions.
    pub mod admin {
        pub const UNEXPECTED_CLIENT_ERROR: i32 = -4;
        pub const OPERATION_NOT_ALLOWED: i32 = -5;
        pub const BUCKET_NOT_FOUND: i32 = -6;
    }
}

pub mod monitor {
    //! Monitor entries recorded per check when monitoring is enabled.

    use crate::types::{PolicyKey, PolicyType};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MonitorEntry {
        pub key: PolicyKey,
        pub result_type: PolicyType,
        /// Milliseconds since UNIX epoch.
        pub timestamp_ms: u64,
    }

    impl MonitorEntry {
        pub fn new(key: PolicyKey, result_type: PolicyType, timestamp_ms: u64) -> Self {
            Self { key, result_type, timestamp_ms }
        }
    }
}
