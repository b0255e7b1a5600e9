//! Policy store: the in-memory bucket graph, the decision engine walking it,
//! and the checksummed on-disk representation.
//!
//! Mutations go through [`Database::mutate`], which persists the whole store
//! after the closure succeeds and restores the previous on-disk generation
//! if persisting fails. Corruption found while loading flips the database
//! into a read-only degraded mode that answers from an empty policy set.

#![deny(unsafe_code)]

pub mod engine;
mod persist;

use sentra_core::types::{
    Policy, PolicyBucket, PolicyBucketId, PolicyKey, PolicyResult, PolicyType, ROOT_BUCKET,
};
use sentra_core::validation::{self, ValidationError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info};

/// What made the on-disk database unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorruptionKind {
    #[error("checksum mismatch for {file}")]
    Checksum { file: String },
    #[error("malformed line {line} in {file}")]
    MalformedLine { file: String, line: usize },
    #[error("policy redirects to missing bucket {bucket:?}")]
    DanglingBucket { bucket: String },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("database corrupted: {0}")]
    Corrupted(CorruptionKind),
    #[error("no bucket {0:?}")]
    NoBucket(String),
    #[error("bucket {0:?} is referenced by bucket-typed policies")]
    BucketLinked(String),
    #[error("operation not allowed")]
    NotAllowed,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("could not acquire database lock")]
    LockUnavailable,
}

/// The bucket graph. Exactly one root bucket exists at all times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyStorage {
    buckets: BTreeMap<PolicyBucketId, PolicyBucket>,
}

impl Default for PolicyStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStorage {
    /// An empty store: just the root bucket defaulting to `DENY`.
    pub fn new() -> Self {
        let mut buckets = BTreeMap::new();
        buckets
            .insert(ROOT_BUCKET.to_owned(), PolicyBucket::new(ROOT_BUCKET, PolicyResult::deny()));
        Self { buckets }
    }

    pub fn bucket(&self, id: &str) -> Option<&PolicyBucket> {
        self.buckets.get(id)
    }

    pub fn contains_bucket(&self, id: &str) -> bool {
        self.buckets.contains_key(id)
    }

    pub fn buckets(&self) -> impl Iterator<Item = &PolicyBucket> {
        self.buckets.values()
    }

    /// Resolve `key` starting from the root bucket. A `NONE` surfacing at
    /// the top level falls through to the root default, exactly as it would
    /// inside a redirect chain.
    pub fn check(&self, key: &PolicyKey) -> PolicyResult {
        // The root bucket always exists, so the walk cannot fail.
        let result = engine::check(self, ROOT_BUCKET, key).unwrap_or_else(|_| PolicyResult::deny());
        if result.policy_type == PolicyType::NONE {
            if let Some(root) = self.bucket(ROOT_BUCKET) {
                return root.default_result.clone();
            }
        }
        result
    }

    /// Admin-side check from an arbitrary bucket; the raw engine result is
    /// reported, `NONE` included.
    pub fn check_from(
        &self,
        bucket: &str,
        key: &PolicyKey,
        recursive: bool,
    ) -> Result<PolicyResult, StorageError> {
        if recursive {
            engine::check(self, bucket, key)
        } else {
            engine::check_single(self, bucket, key)
        }
    }

    /// Create a bucket or replace an existing bucket's default result. The
    /// default may be any type except `BUCKET`.
    pub fn insert_or_update_bucket(
        &mut self,
        id: &str,
        default_result: PolicyResult,
    ) -> Result<(), StorageError> {
        validation::validate_bucket_id(id)?;
        validate_metadata(&default_result.metadata)?;
        if default_result.policy_type == PolicyType::BUCKET {
            return Err(StorageError::NotAllowed);
        }
        match self.buckets.get_mut(id) {
            Some(bucket) => bucket.default_result = default_result,
            None => {
                self.buckets.insert(id.to_owned(), PolicyBucket::new(id, default_result));
            }
        }
        Ok(())
    }

    /// Delete a bucket. The root bucket is never deleted. A bucket still
    /// referenced by `BUCKET`-typed policies is only deleted when
    /// `recursive` is set, which also drops the referencing policies.
    pub fn delete_bucket(&mut self, id: &str, recursive: bool) -> Result<(), StorageError> {
        if id == ROOT_BUCKET {
            return Err(StorageError::NotAllowed);
        }
        if !self.buckets.contains_key(id) {
            return Err(StorageError::NoBucket(id.to_owned()));
        }
        let linked = self.linking_policies(id);
        if !linked.is_empty() {
            if !recursive {
                return Err(StorageError::BucketLinked(id.to_owned()));
            }
            for (bucket_id, key) in linked {
                if let Some(bucket) = self.buckets.get_mut(&bucket_id) {
                    bucket.remove_policy(&key);
                }
            }
        }
        self.buckets.remove(id);
        Ok(())
    }

    /// Insert or replace one policy inside `bucket`.
    pub fn set_policy(&mut self, bucket: &str, policy: Policy) -> Result<(), StorageError> {
        validation::validate_key(&policy.key)?;
        validate_metadata(&policy.result.metadata)?;
        if policy.result.policy_type == PolicyType::BUCKET
            && !self.buckets.contains_key(&policy.result.metadata)
        {
            return Err(StorageError::NoBucket(policy.result.metadata.clone()));
        }
        let target = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::NoBucket(bucket.to_owned()))?;
        target.set_policy(policy);
        Ok(())
    }

    /// Delete the policy with `key` from `bucket`; true when one existed.
    pub fn delete_policy(&mut self, bucket: &str, key: &PolicyKey) -> Result<bool, StorageError> {
        let target = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::NoBucket(bucket.to_owned()))?;
        Ok(target.remove_policy(key))
    }

    /// Apply a batch of insertions and removals atomically: everything is
    /// validated before the first change is made.
    pub fn set_policies(
        &mut self,
        insert_or_update: &[(PolicyBucketId, Vec<Policy>)],
        remove: &[(PolicyBucketId, Vec<PolicyKey>)],
    ) -> Result<(), StorageError> {
        for (bucket, policies) in insert_or_update {
            if !self.buckets.contains_key(bucket) {
                return Err(StorageError::NoBucket(bucket.clone()));
            }
            for policy in policies {
                validation::validate_key(&policy.key)?;
                validate_metadata(&policy.result.metadata)?;
                if policy.result.policy_type == PolicyType::BUCKET
                    && !self.buckets.contains_key(&policy.result.metadata)
                {
                    return Err(StorageError::NoBucket(policy.result.metadata.clone()));
                }
            }
        }
        for (bucket, _) in remove {
            if !self.buckets.contains_key(bucket) {
                return Err(StorageError::NoBucket(bucket.clone()));
            }
        }
        for (bucket, policies) in insert_or_update {
            if let Some(target) = self.buckets.get_mut(bucket) {
                for policy in policies {
                    target.set_policy(policy.clone());
                }
            }
        }
        for (bucket, keys) in remove {
            if let Some(target) = self.buckets.get_mut(bucket) {
                for key in keys {
                    target.remove_policy(key);
                }
            }
        }
        Ok(())
    }

    /// Policies of `bucket` whose key is covered by `filter` (a `*`
    /// component of the filter matches anything in that position).
    pub fn list_policies(
        &self,
        bucket: &str,
        filter: &PolicyKey,
    ) -> Result<Vec<Policy>, StorageError> {
        let bucket =
            self.buckets.get(bucket).ok_or_else(|| StorageError::NoBucket(bucket.to_owned()))?;
        Ok(bucket
            .policies
            .iter()
            .filter(|(key, _)| filter.matches(key))
            .map(|(key, result)| Policy::new(key.clone(), result.clone()))
            .collect())
    }

    /// Remove every policy matching `filter` from `bucket` and, when
    /// `recursive`, from every bucket reachable through `BUCKET`-typed
    /// policies. Cycles are cut by a visited set; the traversal is computed
    /// on the pre-erase graph.
    pub fn erase(
        &mut self,
        bucket: &str,
        recursive: bool,
        filter: &PolicyKey,
    ) -> Result<(), StorageError> {
        if !self.buckets.contains_key(bucket) {
            return Err(StorageError::NoBucket(bucket.to_owned()));
        }
        let mut targets = vec![bucket.to_owned()];
        if recursive {
            let mut stack = vec![bucket.to_owned()];
            while let Some(id) = stack.pop() {
                let links: Vec<PolicyBucketId> = match self.buckets.get(&id) {
                    Some(b) => b
                        .policies
                        .values()
                        .filter(|r| r.policy_type == PolicyType::BUCKET)
                        .map(|r| r.metadata.clone())
                        .collect(),
                    None => continue,
                };
                for link in links {
                    if !targets.contains(&link) {
                        targets.push(link.clone());
                        stack.push(link);
                    }
                }
            }
        }
        for id in targets {
            if let Some(b) = self.buckets.get_mut(&id) {
                b.policies.retain(|key, _| !filter.matches(key));
            }
        }
        Ok(())
    }

    /// `(owning bucket, key)` of every `BUCKET`-typed policy pointing at `id`.
    fn linking_policies(&self, id: &str) -> Vec<(PolicyBucketId, PolicyKey)> {
        let mut out = Vec::new();
        for bucket in self.buckets.values() {
            for (key, result) in &bucket.policies {
                if result.policy_type == PolicyType::BUCKET && result.metadata == id {
                    out.push((bucket.id.clone(), key.clone()));
                }
            }
        }
        out
    }
}

fn validate_metadata(metadata: &str) -> Result<(), ValidationError> {
    if metadata.len() > sentra_core::limits::MAX_ID_LENGTH
        || metadata.chars().any(|c| c == '\n' || c == '\r')
    {
        return Err(ValidationError::InvalidIdentifier(metadata.to_owned()));
    }
    Ok(())
}

/// The persistent store: bucket graph plus its on-disk home.
#[derive(Debug)]
pub struct Database {
    dir: PathBuf,
    storage: PolicyStorage,
    corruption: Option<CorruptionKind>,
}

impl Database {
    /// Load the database under `dir`, creating a fresh one when the
    /// directory does not exist yet. Corruption degrades to a read-only
    /// empty store instead of failing; plain I/O errors propagate.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        match persist::load(&dir) {
            Ok(storage) => {
                info!(dir = %dir.display(), buckets = storage.buckets.len(), "policy database loaded");
                Ok(Self { dir, storage, corruption: None })
            }
            Err(StorageError::Corrupted(kind)) => {
                error!(dir = %dir.display(), %kind, "policy database corrupted, entering read-only mode");
                Ok(Self { dir, storage: PolicyStorage::new(), corruption: Some(kind) })
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_corrupted(&self) -> bool {
        self.corruption.is_some()
    }

    pub fn corruption(&self) -> Option<&CorruptionKind> {
        self.corruption.as_ref()
    }

    pub fn storage(&self) -> &PolicyStorage {
        &self.storage
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run one mutation and persist the result. A failed mutation leaves the
    /// store untouched; a failed persist rolls the in-memory state back to
    /// the previous on-disk generation. In degraded mode every mutation is
    /// refused.
    pub fn mutate<F>(&mut self, op: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut PolicyStorage) -> Result<(), StorageError>,
    {
        if let Some(kind) = &self.corruption {
            return Err(StorageError::Corrupted(kind.clone()));
        }
        op(&mut self.storage)?;
        if let Err(persist_err) = persist::persist(&self.storage, &self.dir) {
            error!(error = %persist_err, "persisting policy database failed, restoring previous snapshot");
            match persist::load(&self.dir) {
                Ok(previous) => self.storage = previous,
                Err(load_err) => {
                    error!(error = %load_err, "could not restore previous snapshot, entering read-only mode");
                    self.storage = PolicyStorage::new();
                    self.corruption = Some(match load_err {
                        StorageError::Corrupted(kind) => kind,
                        _ => CorruptionKind::Checksum { file: "checksum".to_owned() },
                    });
                }
            }
            return Err(persist_err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc(c: &str, u: &str, p: &str) -> PolicyKey {
        PolicyKey::new(c, u, p)
    }

    #[test]
    fn root_exists_and_cannot_be_deleted() {
        let mut s = PolicyStorage::new();
        assert!(s.contains_bucket(ROOT_BUCKET));
        assert!(matches!(s.delete_bucket(ROOT_BUCKET, true), Err(StorageError::NotAllowed)));
    }

    #[test]
    fn bucket_policy_must_point_at_existing_bucket() {
        let mut s = PolicyStorage::new();
        let policy = Policy::new(abc("a", "b", "c"), PolicyResult::bucket("nowhere"));
        assert!(matches!(
            s.set_policy(ROOT_BUCKET, policy),
            Err(StorageError::NoBucket(b)) if b == "nowhere"
        ));
    }

    #[test]
    fn linked_bucket_needs_recursive_delete() {
        let mut s = PolicyStorage::new();
        s.insert_or_update_bucket("cam", PolicyResult::deny()).unwrap();
        s.set_policy(ROOT_BUCKET, Policy::new(abc("*", "*", "camera"), PolicyResult::bucket("cam")))
            .unwrap();
        assert!(matches!(s.delete_bucket("cam", false), Err(StorageError::BucketLinked(_))));
        s.delete_bucket("cam", true).unwrap();
        assert!(!s.contains_bucket("cam"));
        // The policy that pointed at the bucket is gone with it.
        assert!(s.list_policies(ROOT_BUCKET, &PolicyKey::any()).unwrap().is_empty());
    }

    #[test]
    fn bucket_default_may_not_redirect() {
        let mut s = PolicyStorage::new();
        assert!(matches!(
            s.insert_or_update_bucket("x", PolicyResult::bucket("y")),
            Err(StorageError::NotAllowed)
        ));
    }

    #[test]
    fn set_policies_validates_before_applying() {
        let mut s = PolicyStorage::new();
        let good = (
            ROOT_BUCKET.to_owned(),
            vec![Policy::new(abc("a", "b", "c"), PolicyResult::allow())],
        );
        let bad = ("ghost".to_owned(), vec![]);
        assert!(s.set_policies(&[good, bad], &[]).is_err());
        // Nothing from the failed batch landed.
        assert!(s.list_policies(ROOT_BUCKET, &PolicyKey::any()).unwrap().is_empty());
    }

    #[test]
    fn delete_policy_reports_presence() {
        let mut s = PolicyStorage::new();
        let key = abc("app", "u", "cam");
        s.set_policy(ROOT_BUCKET, Policy::new(key.clone(), PolicyResult::allow())).unwrap();
        assert!(s.delete_policy(ROOT_BUCKET, &key).unwrap());
        assert!(!s.delete_policy(ROOT_BUCKET, &key).unwrap());
        assert!(matches!(s.delete_policy("ghost", &key), Err(StorageError::NoBucket(_))));
    }

    #[test]
    fn erase_honors_filter_wildcards() {
        let mut s = PolicyStorage::new();
        s.set_policy(ROOT_BUCKET, Policy::new(abc("app", "u1", "cam"), PolicyResult::allow()))
            .unwrap();
        s.set_policy(ROOT_BUCKET, Policy::new(abc("app", "u2", "mic"), PolicyResult::allow()))
            .unwrap();
        s.set_policy(ROOT_BUCKET, Policy::new(abc("other", "u1", "cam"), PolicyResult::allow()))
            .unwrap();
        s.erase(ROOT_BUCKET, false, &abc("app", "*", "*")).unwrap();
        let left = s.list_policies(ROOT_BUCKET, &PolicyKey::any()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].key, abc("other", "u1", "cam"));
    }

    #[test]
    fn recursive_erase_follows_bucket_links() {
        let mut s = PolicyStorage::new();
        s.insert_or_update_bucket("cam", PolicyResult::deny()).unwrap();
        s.set_policy(ROOT_BUCKET, Policy::new(abc("*", "*", "camera"), PolicyResult::bucket("cam")))
            .unwrap();
        s.set_policy("cam", Policy::new(abc("app", "*", "*"), PolicyResult::allow())).unwrap();
        s.erase(ROOT_BUCKET, true, &abc("app", "*", "*")).unwrap();
        assert!(s.list_policies("cam", &PolicyKey::any()).unwrap().is_empty());
        // The redirect itself does not match the filter and stays.
        assert_eq!(s.list_policies(ROOT_BUCKET, &PolicyKey::any()).unwrap().len(), 1);
    }

    #[test]
    fn recursive_erase_survives_cycles() {
        let mut s = PolicyStorage::new();
        s.insert_or_update_bucket("a", PolicyResult::deny()).unwrap();
        s.insert_or_update_bucket("b", PolicyResult::deny()).unwrap();
        s.set_policy("a", Policy::new(abc("*", "*", "x"), PolicyResult::bucket("b"))).unwrap();
        s.set_policy("b", Policy::new(abc("*", "*", "x"), PolicyResult::bucket("a"))).unwrap();
        s.set_policy(ROOT_BUCKET, Policy::new(abc("*", "*", "*"), PolicyResult::bucket("a")))
            .unwrap();
        s.erase(ROOT_BUCKET, true, &PolicyKey::any()).unwrap();
        assert!(s.list_policies("a", &PolicyKey::any()).unwrap().is_empty());
        assert!(s.list_policies("b", &PolicyKey::any()).unwrap().is_empty());
    }
}
