use criterion::{criterion_group, criterion_main, Criterion};
use sentra_core::types::{Policy, PolicyKey, PolicyResult, ROOT_BUCKET};
use storage::PolicyStorage;

fn populated_storage(per_bucket: usize) -> PolicyStorage {
    let mut s = PolicyStorage::new();
    s.insert_or_update_bucket("cam", PolicyResult::deny()).unwrap();
    s.set_policy(
        ROOT_BUCKET,
        Policy::new(PolicyKey::new("*", "*", "camera"), PolicyResult::bucket("cam")),
    )
    .unwrap();
    for i in 0..per_bucket {
        s.set_policy(
            ROOT_BUCKET,
            Policy::new(
                PolicyKey::new(format!("app-{i}"), "*", format!("priv-{i}")),
                PolicyResult::allow(),
            ),
        )
        .unwrap();
        s.set_policy(
            "cam",
            Policy::new(PolicyKey::new(format!("app-{i}"), "*", "*"), PolicyResult::allow()),
        )
        .unwrap();
    }
    s
}

fn bench_check(c: &mut Criterion) {
    let s = populated_storage(1_000);
    let direct = PolicyKey::new("app-500", "user", "priv-500");
    let redirected = PolicyKey::new("app-500", "user", "camera");
    c.bench_function("check_direct_1k", |b| b.iter(|| s.check(&direct)));
    c.bench_function("check_redirect_1k", |b| b.iter(|| s.check(&redirected)));
}

criterion_group!(benches, bench_check);
criterion_main!(benches);
