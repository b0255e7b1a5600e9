// On-disk round-trip, corruption handling and the backup-and-swap scheme.

use proptest::prelude::*;
use sentra_core::types::{Policy, PolicyKey, PolicyResult, PolicyType, ROOT_BUCKET};
use std::fs;
use std::path::Path;
use storage::{CorruptionKind, Database, StorageError};

fn db_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("db")
}

fn seed(db: &mut Database) {
    db.mutate(|s| {
        s.insert_or_update_bucket("cam", PolicyResult::deny())?;
        s.set_policy(
            ROOT_BUCKET,
            Policy::new(PolicyKey::new("*", "*", "camera"), PolicyResult::bucket("cam")),
        )?;
        s.set_policy(
            "cam",
            Policy::new(PolicyKey::new("app-A", "*", "*"), PolicyResult::allow()),
        )?;
        s.set_policy(
            ROOT_BUCKET,
            Policy::new(
                PolicyKey::new("app-B", "user", "mic"),
                PolicyResult::new(PolicyType(0x0010), "ask;with;separators"),
            ),
        )
    })
    .unwrap();
}

fn rewrite_checksums(dir: &Path) {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n == "buckets" || n.starts_with('_'))
        .collect();
    names.sort();
    let mut body = String::new();
    for name in names {
        let digest = hex::encode(md5::compute(fs::read(dir.join(&name)).unwrap()).0);
        body.push_str(&format!("{name};{digest}\n"));
    }
    let self_digest = hex::encode(md5::compute(body.as_bytes()).0);
    fs::write(dir.join("checksum"), format!("{body}checksum;{self_digest}\n")).unwrap();
}

#[test]
fn bootstrap_creates_a_loadable_root_only_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(db_path(&dir)).unwrap();
    assert!(!db.is_corrupted());
    assert!(db.storage().contains_bucket(ROOT_BUCKET));
    assert_eq!(db.storage().check(&PolicyKey::new("a", "b", "c")), PolicyResult::deny());
    for name in ["buckets", "_", "checksum", "lock"] {
        assert!(db_path(&dir).join(name).exists(), "missing {name}");
    }
}

#[test]
fn persisted_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::open(db_path(&dir)).unwrap();
    seed(&mut db);
    let before = db.storage().clone();
    drop(db);

    let reopened = Database::open(db_path(&dir)).unwrap();
    assert!(!reopened.is_corrupted());
    assert_eq!(*reopened.storage(), before);
}

#[test]
fn edited_policy_file_fails_the_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::open(db_path(&dir)).unwrap();
    seed(&mut db);
    drop(db);

    // Strip one character from a policy line, recompute no checksum.
    let bucket_file = db_path(&dir).join("_cam");
    let contents = fs::read_to_string(&bucket_file).unwrap();
    fs::write(&bucket_file, &contents[..contents.len() - 2]).unwrap();

    let db = Database::open(db_path(&dir)).unwrap();
    assert_eq!(
        db.corruption(),
        Some(&CorruptionKind::Checksum { file: "_cam".to_owned() })
    );
    // Degraded mode answers from an empty policy set and refuses mutations.
    assert_eq!(db.storage().check(&PolicyKey::new("app-A", "u", "camera")), PolicyResult::deny());
    let mut db = db;
    assert!(matches!(db.mutate(|_| Ok(())), Err(StorageError::Corrupted(_))));
}

#[test]
fn tampered_checksum_file_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::open(db_path(&dir)).unwrap();
    seed(&mut db);
    drop(db);

    let checksum_file = db_path(&dir).join("checksum");
    let mut contents = fs::read_to_string(&checksum_file).unwrap();
    contents = contents.replacen('0', "1", 1);
    fs::write(&checksum_file, contents).unwrap();

    let db = Database::open(db_path(&dir)).unwrap();
    assert!(matches!(db.corruption(), Some(CorruptionKind::Checksum { .. })));
}

#[test]
fn malformed_line_with_valid_checksum_is_reported_with_its_number() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::open(db_path(&dir)).unwrap();
    seed(&mut db);
    drop(db);

    let bucket_file = db_path(&dir).join("_");
    let mut contents = fs::read_to_string(&bucket_file).unwrap();
    contents.push_str("only;three;fields\n");
    fs::write(&bucket_file, &contents).unwrap();
    rewrite_checksums(&db_path(&dir));

    let db = Database::open(db_path(&dir)).unwrap();
    let line = contents.lines().count();
    assert_eq!(
        db.corruption(),
        Some(&CorruptionKind::MalformedLine { file: "_".to_owned(), line })
    );
}

#[test]
fn dangling_bucket_reference_is_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::open(db_path(&dir)).unwrap();
    seed(&mut db);
    drop(db);

    let bucket_file = db_path(&dir).join("_");
    let mut contents = fs::read_to_string(&bucket_file).unwrap();
    contents.push_str("x;y;z;0xfffe;ghost\n");
    fs::write(&bucket_file, &contents).unwrap();
    rewrite_checksums(&db_path(&dir));

    let db = Database::open(db_path(&dir)).unwrap();
    assert_eq!(
        db.corruption(),
        Some(&CorruptionKind::DanglingBucket { bucket: "ghost".to_owned() })
    );
}

#[test]
fn interrupted_swap_recovers_the_complete_generation() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::open(db_path(&dir)).unwrap();
    seed(&mut db);
    let expected = db.storage().clone();
    drop(db);

    // Crash after the live directory was moved aside but before the fresh
    // generation was renamed in: live is gone, the complete tree sits in `~`.
    let live = db_path(&dir);
    let tmp = dir.path().join("db~");
    fs::rename(&live, &tmp).unwrap();
    let db = Database::open(&live).unwrap();
    assert!(!db.is_corrupted());
    assert_eq!(*db.storage(), expected);

    // Crash right after the backup rename: only `.bak` remains.
    drop(db);
    let bak = dir.path().join("db.bak");
    fs::rename(&live, &bak).unwrap();
    let db = Database::open(&live).unwrap();
    assert!(!db.is_corrupted());
    assert_eq!(*db.storage(), expected);
}

#[test]
fn failed_persist_keeps_the_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::open(db_path(&dir)).unwrap();
    seed(&mut db);
    let before = db.storage().clone();

    // A plain file squatting on the scratch directory makes the write fail.
    fs::write(dir.path().join("db~"), b"obstacle").unwrap();
    let res = db.mutate(|s| {
        s.set_policy(
            ROOT_BUCKET,
            Policy::new(PolicyKey::new("new", "new", "new"), PolicyResult::allow()),
        )
    });
    assert!(res.is_err());
    assert!(!db.is_corrupted());
    assert_eq!(*db.storage(), before);

    // With the obstacle gone the same mutation lands.
    fs::remove_file(dir.path().join("db~")).unwrap();
    db.mutate(|s| {
        s.set_policy(
            ROOT_BUCKET,
            Policy::new(PolicyKey::new("new", "new", "new"), PolicyResult::allow()),
        )
    })
    .unwrap();
    assert_ne!(*db.storage(), before);
}

#[test]
fn held_lock_makes_writes_fail() {
    use fs2::FileExt;
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::open(db_path(&dir)).unwrap();

    let lock = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(db_path(&dir).join("lock"))
        .unwrap();
    lock.lock_exclusive().unwrap();
    let res = db.mutate(|s| s.insert_or_update_bucket("cam", PolicyResult::deny()));
    assert!(matches!(res, Err(StorageError::LockUnavailable)));
    FileExt::unlock(&lock).unwrap();

    db.mutate(|s| s.insert_or_update_bucket("cam", PolicyResult::deny())).unwrap();
}

fn small_id() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z]{1,6}").unwrap()
}

fn component() -> impl Strategy<Value = String> {
    prop_oneof![Just("*".to_owned()), proptest::string::string_regex("[a-z.]{1,8}").unwrap()]
}

fn result_strategy() -> impl Strategy<Value = PolicyResult> {
    prop_oneof![
        Just(PolicyResult::allow()),
        Just(PolicyResult::deny()),
        Just(PolicyResult::none()),
        proptest::string::string_regex("[a-z ;=]{0,12}")
            .unwrap()
            .prop_map(|m| PolicyResult::new(PolicyType(0x0010), m)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn any_valid_store_round_trips(
        buckets in proptest::collection::vec(small_id(), 0..4),
        policies in proptest::collection::vec(
            (component(), component(), component(), result_strategy()),
            0..12,
        ),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open(db_path(&dir)).unwrap();
        db.mutate(|s| {
            for b in &buckets {
                s.insert_or_update_bucket(b, PolicyResult::none())?;
            }
            for (i, (c, u, p, r)) in policies.iter().enumerate() {
                let bucket = if buckets.is_empty() {
                    ROOT_BUCKET.to_owned()
                } else {
                    buckets[i % buckets.len()].clone()
                };
                s.set_policy(&bucket, Policy::new(PolicyKey::new(c, u, p), r.clone()))?;
            }
            Ok(())
        }).unwrap();
        let before = db.storage().clone();
        drop(db);

        let reopened = Database::open(db_path(&dir)).unwrap();
        prop_assert!(!reopened.is_corrupted());
        prop_assert_eq!(reopened.storage(), &before);
    }
}
