//! Checksummed text persistence.
//!
//! Layout under the database directory:
//!
//! ```text
//! buckets     index, first line `version=1`, then `bucket_id;type;metadata`
//! _           root bucket policies, one `client;user;privilege;type;metadata` per line
//! _<id>       same, for bucket <id>
//! checksum    `filename;md5hex` per line, terminated by a self-checksum line
//! lock        advisory-lock file taken for the duration of a write
//! ```
//!
//! A write builds the complete next generation in a `~`-suffixed sibling
//! directory, fsyncs it, then swaps directories through a `.bak` backup so a
//! crash at any instant leaves a loadable generation behind.

use crate::{CorruptionKind, PolicyStorage, StorageError};
use fs2::FileExt;
use sentra_core::types::{Policy, PolicyBucket, PolicyKey, PolicyResult, PolicyType, ROOT_BUCKET};
use sentra_core::validation;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const INDEX_FILE: &str = "buckets";
const CHECKSUM_FILE: &str = "checksum";
const LOCK_FILE: &str = "lock";
const SCHEMA_VERSION: u32 = 1;
const LOCK_ATTEMPTS: u32 = 10;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);

fn bucket_file_name(id: &str) -> String {
    format!("_{id}")
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    dir.with_file_name(name)
}

fn md5_hex(bytes: &[u8]) -> String {
    hex::encode(md5::compute(bytes).0)
}

fn corrupted(kind: CorruptionKind) -> StorageError {
    StorageError::Corrupted(kind)
}

fn malformed(file: &str, line: usize) -> StorageError {
    corrupted(CorruptionKind::MalformedLine { file: file.to_owned(), line })
}

fn checksum_mismatch(file: &str) -> StorageError {
    corrupted(CorruptionKind::Checksum { file: file.to_owned() })
}

// ---------------------------------------------------------------- rendering

fn render_result(result: &PolicyResult) -> String {
    format!("0x{:04x};{}", result.policy_type.0, result.metadata)
}

fn render_index(storage: &PolicyStorage) -> String {
    let mut out = format!("version={SCHEMA_VERSION}\n");
    for bucket in storage.buckets() {
        out.push_str(&bucket.id);
        out.push(';');
        out.push_str(&render_result(&bucket.default_result));
        out.push('\n');
    }
    out
}

fn render_bucket(bucket: &PolicyBucket) -> String {
    let mut out = String::new();
    for (key, result) in &bucket.policies {
        out.push_str(&format!(
            "{};{};{};{}\n",
            key.client,
            key.user,
            key.privilege,
            render_result(result)
        ));
    }
    out
}

fn parse_type(token: &str) -> Option<PolicyType> {
    let digits = token.strip_prefix("0x")?;
    u16::from_str_radix(digits, 16).ok().map(PolicyType)
}

// ------------------------------------------------------------------ loading

/// Load the store under `dir`, bootstrapping a fresh database when the
/// directory does not exist and recovering an interrupted swap when it does.
pub(crate) fn load(dir: &Path) -> Result<PolicyStorage, StorageError> {
    recover_generations(dir)?;
    if !dir.exists() {
        debug!(dir = %dir.display(), "no policy database, bootstrapping");
        let storage = PolicyStorage::new();
        persist(&storage, dir)?;
        return Ok(storage);
    }

    let checksums = read_checksums(dir)?;
    let index = read_verified(dir, INDEX_FILE, &checksums)?;
    let index =
        String::from_utf8(index).map_err(|_| malformed(INDEX_FILE, 0))?;

    let mut storage = PolicyStorage { buckets: BTreeMap::new() };
    let mut lines = index.lines().enumerate();
    match lines.next() {
        Some((_, line)) if line == format!("version={SCHEMA_VERSION}") => {}
        _ => return Err(malformed(INDEX_FILE, 1)),
    }
    for (i, line) in lines {
        let line_no = i + 1;
        let mut parts = line.splitn(3, ';');
        let (id, type_token, metadata) = match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(t), Some(m)) => (id, t, m),
            _ => return Err(malformed(INDEX_FILE, line_no)),
        };
        validation::validate_bucket_id(id).map_err(|_| malformed(INDEX_FILE, line_no))?;
        let policy_type =
            parse_type(type_token).ok_or_else(|| malformed(INDEX_FILE, line_no))?;
        if policy_type == PolicyType::BUCKET {
            return Err(malformed(INDEX_FILE, line_no));
        }
        let bucket =
            PolicyBucket::new(id, PolicyResult::new(policy_type, metadata));
        if storage.buckets.insert(id.to_owned(), bucket).is_some() {
            return Err(malformed(INDEX_FILE, line_no));
        }
    }
    if !storage.buckets.contains_key(ROOT_BUCKET) {
        // An index without the root bucket is no database at all.
        return Err(malformed(INDEX_FILE, 1));
    }

    let ids: Vec<String> = storage.buckets.keys().cloned().collect();
    for id in &ids {
        let file_name = bucket_file_name(id);
        let bytes = read_verified(dir, &file_name, &checksums)?;
        let text = String::from_utf8(bytes).map_err(|_| malformed(&file_name, 0))?;
        for (i, line) in text.lines().enumerate() {
            let line_no = i + 1;
            let fields: Vec<&str> = line.splitn(5, ';').collect();
            if fields.len() != 5 {
                return Err(malformed(&file_name, line_no));
            }
            let (client, user, privilege, type_token, metadata) =
                (fields[0], fields[1], fields[2], fields[3], fields[4]);
            let policy_type =
                parse_type(type_token).ok_or_else(|| malformed(&file_name, line_no))?;
            let key = PolicyKey::new(client, user, privilege);
            validation::validate_key(&key).map_err(|_| malformed(&file_name, line_no))?;
            let policy = Policy::new(key, PolicyResult::new(policy_type, metadata));
            if let Some(bucket) = storage.buckets.get_mut(id) {
                bucket.set_policy(policy);
            }
        }
    }

    for bucket in storage.buckets.values() {
        for result in bucket.policies.values() {
            if result.policy_type == PolicyType::BUCKET
                && !storage.buckets.contains_key(&result.metadata)
            {
                return Err(corrupted(CorruptionKind::DanglingBucket {
                    bucket: result.metadata.clone(),
                }));
            }
        }
    }

    Ok(storage)
}

fn read_checksums(dir: &Path) -> Result<BTreeMap<String, String>, StorageError> {
    let bytes = match fs::read(dir.join(CHECKSUM_FILE)) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(checksum_mismatch(CHECKSUM_FILE))
        }
        Err(e) => return Err(e.into()),
    };
    let text = String::from_utf8(bytes).map_err(|_| malformed(CHECKSUM_FILE, 0))?;
    let stripped = text.strip_suffix('\n').ok_or_else(|| malformed(CHECKSUM_FILE, 0))?;
    let (body, self_line) = match stripped.rfind('\n') {
        Some(i) => (&text[..=i], &stripped[i + 1..]),
        None => ("", stripped),
    };
    let self_digest = self_line
        .strip_prefix(&format!("{CHECKSUM_FILE};"))
        .ok_or_else(|| checksum_mismatch(CHECKSUM_FILE))?;
    if md5_hex(body.as_bytes()) != self_digest {
        return Err(checksum_mismatch(CHECKSUM_FILE));
    }
    let mut out = BTreeMap::new();
    for (i, line) in body.lines().enumerate() {
        let (name, digest) =
            line.split_once(';').ok_or_else(|| malformed(CHECKSUM_FILE, i + 1))?;
        out.insert(name.to_owned(), digest.to_owned());
    }
    Ok(out)
}

fn read_verified(
    dir: &Path,
    name: &str,
    checksums: &BTreeMap<String, String>,
) -> Result<Vec<u8>, StorageError> {
    let expected = checksums.get(name).ok_or_else(|| checksum_mismatch(name))?;
    let bytes = match fs::read(dir.join(name)) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(checksum_mismatch(name))
        }
        Err(e) => return Err(e.into()),
    };
    if md5_hex(&bytes) != *expected {
        return Err(checksum_mismatch(name));
    }
    Ok(bytes)
}

// ---------------------------------------------------------------- persisting

/// Write the complete store as a fresh generation and swap it in.
pub(crate) fn persist(storage: &PolicyStorage, dir: &Path) -> Result<(), StorageError> {
    if let Some(parent) = dir.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let _lock = if dir.exists() { Some(acquire_lock(&dir.join(LOCK_FILE))?) } else { None };

    let tmp = sibling(dir, "~");
    if tmp.exists() {
        fs::remove_dir_all(&tmp)?;
    }
    fs::create_dir_all(&tmp)?;

    let mut manifest: Vec<(String, String)> =
        vec![(INDEX_FILE.to_owned(), render_index(storage))];
    for bucket in storage.buckets() {
        manifest.push((bucket_file_name(&bucket.id), render_bucket(bucket)));
    }
    for (name, contents) in &manifest {
        write_file(&tmp, name, contents.as_bytes())?;
    }
    let mut body = String::new();
    for (name, contents) in &manifest {
        body.push_str(&format!("{name};{}\n", md5_hex(contents.as_bytes())));
    }
    let self_line = format!("{CHECKSUM_FILE};{}\n", md5_hex(body.as_bytes()));
    write_file(&tmp, CHECKSUM_FILE, format!("{body}{self_line}").as_bytes())?;
    write_file(&tmp, LOCK_FILE, b"")?;
    fsync_dir(&tmp)?;

    let bak = sibling(dir, ".bak");
    if bak.exists() {
        fs::remove_dir_all(&bak)?;
    }
    if dir.exists() {
        fs::rename(dir, &bak)?;
    }
    fs::rename(&tmp, dir)?;
    if let Some(parent) = dir.parent() {
        if !parent.as_os_str().is_empty() {
            fsync_dir(parent)?;
        }
    }
    if bak.exists() {
        fs::remove_dir_all(&bak)?;
    }
    Ok(())
}

/// Bring the directory trio (live, `~`, `.bak`) back to a single live
/// generation after a possible crash mid-swap. The `~` generation is only
/// ever promoted when the live directory is gone, which can only happen
/// after the generation was completely written.
fn recover_generations(dir: &Path) -> Result<(), StorageError> {
    let tmp = sibling(dir, "~");
    let bak = sibling(dir, ".bak");
    if dir.exists() {
        // Leftovers from an interrupted write are dead weight; failing to
        // clear them must not keep the live generation from loading.
        for leftover in [&bak, &tmp] {
            if leftover.exists() {
                if let Err(e) = fs::remove_dir_all(leftover) {
                    warn!(path = %leftover.display(), error = %e, "could not clear stale generation");
                }
            }
        }
        return Ok(());
    }
    if tmp.exists() {
        warn!(dir = %dir.display(), "promoting interrupted database generation");
        fs::rename(&tmp, dir)?;
        if bak.exists() {
            fs::remove_dir_all(&bak)?;
        }
        return Ok(());
    }
    if bak.exists() {
        warn!(dir = %dir.display(), "restoring database from backup generation");
        fs::rename(&bak, dir)?;
    }
    Ok(())
}

fn acquire_lock(path: &Path) -> Result<File, StorageError> {
    let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
    for _ in 0..LOCK_ATTEMPTS {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(LOCK_RETRY_DELAY);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(StorageError::LockUnavailable)
}

fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
    let mut file = File::create(dir.join(name))?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn fsync_dir(dir: &Path) -> Result<(), StorageError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}
