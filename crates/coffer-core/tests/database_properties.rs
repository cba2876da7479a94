//! Property tests for the replication engine's invariants.
//!
//! A naive model (ordered `Vec` of live items) is replayed alongside the
//! real engine; for any operation sequence both must agree, and the
//! structural invariants must hold after every step.

use coffer_core::database::{Database, Mutation, Op};
use coffer_crypto::{AesKey, HmacKey};
use proptest::prelude::*;
use serde_json::json;

/// Reference model: items in insertion order.
#[derive(Default)]
struct Model {
    items: Vec<(String, u64)>,
}

impl Model {
    fn apply(&mut self, op: &Op, seq_no: u64) {
        match op {
            Op::Insert { item_id, .. } => {
                if !self.items.iter().any(|(id, _)| id == item_id) {
                    self.items.push((item_id.clone(), seq_no));
                }
            },
            Op::Update { item_id, .. } => {
                if let Some(entry) = self.items.iter_mut().find(|(id, _)| id == item_id) {
                    entry.1 = seq_no;
                }
            },
            Op::Delete { item_id } => {
                self.items.retain(|(id, _)| id != item_id);
            },
        }
    }
}

fn test_db() -> Database {
    let mut db = Database::new("props".to_string(), "cHJvcHM=".to_string());
    db.set_key(AesKey::from_bytes([1u8; 32]));
    db.set_id("db-p".to_string());
    db
}

fn op_strategy() -> impl Strategy<Value = Op> {
    // A small id space so inserts, updates, and deletes actually collide.
    let id = prop_oneof![Just("a"), Just("b"), Just("c"), Just("d"), Just("e")]
        .prop_map(str::to_string);
    prop_oneof![
        (id.clone(), any::<u32>())
            .prop_map(|(item_id, n)| Op::Insert { item_id, record: json!({ "n": n }) }),
        (id.clone(), any::<u32>())
            .prop_map(|(item_id, n)| Op::Update { item_id, record: json!({ "n": n }) }),
        id.prop_map(|item_id| Op::Delete { item_id }),
    ]
}

fn check_structural_invariants(db: &Database) {
    let views = db.item_views();
    assert_eq!(views.len(), db.len(), "index and item map must hold the same ids");

    let mut seen = std::collections::HashSet::new();
    for view in &views {
        assert!(seen.insert(view.item_id.clone()), "index must not contain duplicates");
    }
}

proptest! {
    #[test]
    fn engine_matches_the_ordered_model(ops in prop::collection::vec(op_strategy(), 0..60)) {
        let mut db = test_db();
        let mut model = Model::default();

        for (i, op) in ops.iter().enumerate() {
            let seq_no = (i + 1) as u64;
            model.apply(op, seq_no);
            db.apply_mutations(vec![Mutation { seq_no, ops: vec![op.clone()] }]);
            check_structural_invariants(&db);
        }

        let engine_order: Vec<String> =
            db.item_views().into_iter().map(|view| view.item_id).collect();
        let model_order: Vec<String> =
            model.items.iter().map(|(id, _)| id.clone()).collect();
        prop_assert_eq!(engine_order, model_order);
        // Every transaction was fresh, so the cursor sits at the last one.
        prop_assert_eq!(db.last_seq_no(), ops.len() as u64);
    }

    #[test]
    fn replaying_a_prefix_changes_nothing(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let mutations: Vec<Mutation> = ops
            .iter()
            .enumerate()
            .map(|(i, op)| Mutation { seq_no: (i + 1) as u64, ops: vec![op.clone()] })
            .collect();

        let mut db = test_db();
        db.apply_mutations(mutations.clone());
        let before = db.item_views();
        let cursor = db.last_seq_no();

        // Every already-applied transaction must be a no-op on replay.
        let applied = db.apply_mutations(mutations);
        prop_assert_eq!(applied, 0);
        prop_assert_eq!(db.item_views(), before);
        prop_assert_eq!(db.last_seq_no(), cursor);
    }

    #[test]
    fn batching_is_equivalent_to_sequential_application(
        ops in prop::collection::vec(op_strategy(), 1..20)
    ) {
        // One batch at seq 1 …
        let mut batched = test_db();
        batched.apply_mutations(vec![Mutation { seq_no: 1, ops: ops.clone() }]);

        // … versus the same ops as consecutive transactions.
        let mut sequential = test_db();
        sequential.apply_mutations(
            ops.iter()
                .enumerate()
                .map(|(i, op)| Mutation { seq_no: (i + 1) as u64, ops: vec![op.clone()] })
                .collect(),
        );

        let batched_ids: Vec<String> =
            batched.item_views().into_iter().map(|view| view.item_id).collect();
        let sequential_ids: Vec<String> =
            sequential.item_views().into_iter().map(|view| view.item_id).collect();
        prop_assert_eq!(batched_ids, sequential_ids);
    }

    #[test]
    fn bundle_roundtrip_is_lossless(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let mut source = test_db();
        source.apply_mutations(
            ops.iter()
                .enumerate()
                .map(|(i, op)| Mutation { seq_no: (i + 1) as u64, ops: vec![op.clone()] })
                .collect(),
        );

        let hmac_key = HmacKey::from_bytes([2u8; 32]);
        let built = source.build_bundle(&hmac_key).unwrap();

        let mut replica = test_db();
        replica.apply_encrypted_bundle(&built.bundle, built.seq_no).unwrap();

        prop_assert_eq!(replica.item_views(), source.item_views());
        prop_assert_eq!(replica.last_seq_no(), source.last_seq_no());
        prop_assert_eq!(built.keys.len(), source.len());
    }
}
