//! The recursive bucket-lookup algorithm.
//!
//! For one bucket, the *most specific matching policy* wins: specificity is
//! the number of non-wildcard key components, and equal specificity breaks
//! toward the lexicographically smallest key triple (the policies map
//! iterates in exactly that order). `BUCKET`-typed matches redirect the walk;
//! a bucket revisited within one query answers `NONE`, and a `NONE` bubbling
//! out of a redirect is replaced by the redirecting bucket's default.

use crate::{PolicyStorage, StorageError};
use sentra_core::types::{PolicyBucket, PolicyKey, PolicyResult, PolicyType};
use std::collections::HashSet;

/// Resolve `key` starting at `bucket`, following `BUCKET` redirects.
pub fn check(
    storage: &PolicyStorage,
    bucket: &str,
    key: &PolicyKey,
) -> Result<PolicyResult, StorageError> {
    let mut visited = HashSet::new();
    walk(storage, bucket, key, &mut visited)
}

/// Resolve `key` against `bucket` alone: a matched `BUCKET` policy is
/// returned verbatim instead of being followed.
pub fn check_single(
    storage: &PolicyStorage,
    bucket: &str,
    key: &PolicyKey,
) -> Result<PolicyResult, StorageError> {
    let bucket =
        storage.bucket(bucket).ok_or_else(|| StorageError::NoBucket(bucket.to_owned()))?;
    Ok(match best_match(bucket, key) {
        Some(result) => result.clone(),
        None => bucket.default_result.clone(),
    })
}

fn walk(
    storage: &PolicyStorage,
    bucket_id: &str,
    key: &PolicyKey,
    visited: &mut HashSet<String>,
) -> Result<PolicyResult, StorageError> {
    let bucket =
        storage.bucket(bucket_id).ok_or_else(|| StorageError::NoBucket(bucket_id.to_owned()))?;
    if !visited.insert(bucket_id.to_owned()) {
        return Ok(PolicyResult::none());
    }
    let matched = match best_match(bucket, key) {
        None => return Ok(bucket.default_result.clone()),
        Some(result) => result,
    };
    if matched.policy_type == PolicyType::BUCKET {
        let inner = walk(storage, &matched.metadata, key, visited)?;
        if inner.policy_type == PolicyType::NONE {
            return Ok(bucket.default_result.clone());
        }
        return Ok(inner);
    }
    Ok(matched.clone())
}

fn best_match<'a>(bucket: &'a PolicyBucket, query: &PolicyKey) -> Option<&'a PolicyResult> {
    let mut best: Option<(u8, &'a PolicyResult)> = None;
    for (key, result) in &bucket.policies {
        if !key.matches(query) {
            continue;
        }
        let specificity = key.specificity();
        // Strictly-greater keeps the first (smallest) key among equals.
        if best.map_or(true, |(s, _)| specificity > s) {
            best = Some((specificity, result));
        }
    }
    best.map(|(_, result)| result)
}
