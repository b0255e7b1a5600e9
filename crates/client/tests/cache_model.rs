// The capacity cache against a straightforward reference model of LRU order.

use client::{CapacityCache, Decision};
use proptest::prelude::*;
use sentra_core::types::{PolicyKey, PolicyResult};

const CAPACITY: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Get(u8),
    Update(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![(0u8..12).prop_map(Op::Get), (0u8..12).prop_map(Op::Update)]
}

fn key(n: u8) -> PolicyKey {
    PolicyKey::new(format!("client-{n}"), "user", "privilege")
}

/// Most-recently-used first, never longer than CAPACITY.
#[derive(Debug, Default)]
struct Model {
    order: Vec<u8>,
}

impl Model {
    fn get(&mut self, n: u8) -> bool {
        match self.order.iter().position(|&m| m == n) {
            Some(i) => {
                self.order.remove(i);
                self.order.insert(0, n);
                true
            }
            None => false,
        }
    }

    fn update(&mut self, n: u8) {
        if let Some(i) = self.order.iter().position(|&m| m == n) {
            self.order.remove(i);
        }
        self.order.insert(0, n);
        self.order.truncate(CAPACITY);
    }
}

proptest! {
    #[test]
    fn lru_order_matches_reference_model(ops in proptest::collection::vec(op_strategy(), 0..80)) {
        let mut cache = CapacityCache::new(CAPACITY);
        let mut model = Model::default();
        let session = "model".to_owned();

        for op in &ops {
            match *op {
                Op::Get(n) => {
                    let hit = cache.get(&session, &key(n));
                    let expected = model.get(n);
                    prop_assert_eq!(hit.is_some(), expected, "get({}) diverged", n);
                    if let Some(decision) = hit {
                        prop_assert_eq!(decision, Decision::Allowed);
                    }
                }
                Op::Update(n) => {
                    cache.update(&session, &key(n), PolicyResult::allow());
                    model.update(n);
                }
            }
        }

        prop_assert_eq!(cache.len(), model.order.len());
        // Every key the model still holds must hit, every other key miss.
        for n in 0..12 {
            let expected = model.get(n);
            prop_assert_eq!(cache.get(&session, &key(n)).is_some(), expected);
        }
    }
}
