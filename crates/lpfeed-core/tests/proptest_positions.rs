//! Property-based tests for the positions store state.
//!
//! Covers index completeness under random add/remove sequences, reference
//! counting and MessagePack round-trips.

use std::collections::BTreeMap;

use proptest::prelude::*;

use lpfeed_core::storage::StateContainer;
use lpfeed_core::stores::PositionKey;
use lpfeed_core::stores::positions::PositionState;

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Add(PositionKey),
    Remove(String, String),
}

/// Small alphabets so that adds and removes collide often.
fn arb_key() -> impl Strategy<Value = PositionKey> {
    (
        prop::sample::select(vec!["SOL", "USDC", "JUP"]),
        prop::sample::select(vec!["SOL", "USDC", "BONK"]),
        prop::sample::select(vec!["w1", "w2", "w3"]),
        prop::sample::select(vec!["p1", "p2"]),
    )
        .prop_map(|(x, y, owner, pool)| PositionKey::new(x, y, owner, pool).unwrap())
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => arb_key().prop_map(Op::Add),
        2 => (
            prop::sample::select(vec!["w1", "w2", "w3", "w4"]),
            prop::sample::select(vec!["p1", "p2", "p3"]),
        )
            .prop_map(|(o, p)| Op::Remove(o.to_string(), p.to_string())),
    ]
}

fn apply(ops: &[Op]) -> PositionState {
    let mut state = PositionState::default();
    for op in ops {
        match op {
            Op::Add(key) => {
                state.add(key.clone());
            }
            Op::Remove(owner, pool) => {
                state.remove(owner, pool);
            }
        }
    }
    state
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn incremental_indices_match_rebuild(ops in prop::collection::vec(arb_op(), 0..64)) {
        let state = apply(&ops);
        let rebuilt = PositionState::from_primary(state.primary().clone(), state.threads().clone());
        prop_assert_eq!(&state, &rebuilt);
        prop_assert!(state.primary().values().all(|count| *count > 0));
    }

    #[test]
    fn serialize_round_trip(ops in prop::collection::vec(arb_op(), 0..64)) {
        let state = apply(&ops);
        let bytes = state.serialize().unwrap();
        let restored = PositionState::deserialize(&bytes).unwrap();
        prop_assert_eq!(state, restored);
    }

    #[test]
    fn total_count_tracks_adds_minus_successful_removes(ops in prop::collection::vec(arb_op(), 0..64)) {
        let mut state = PositionState::default();
        let mut expected = 0u64;
        for op in &ops {
            match op {
                Op::Add(key) => {
                    state.add(key.clone());
                    expected += 1;
                }
                Op::Remove(owner, pool) => {
                    if state.remove(owner, pool).is_some() {
                        expected -= 1;
                    }
                }
            }
        }
        prop_assert_eq!(state.primary().values().sum::<u64>(), expected);
    }

    #[test]
    fn zero_counts_are_dropped_on_rebuild(key in arb_key(), count in 0u64..3) {
        let state = PositionState::from_primary(BTreeMap::from([(key, count)]), BTreeMap::new());
        prop_assert_eq!(state.primary().len(), usize::from(count > 0));
    }
}

#[test]
fn reference_counting_sequence() {
    let key = PositionKey::new("SOL", "USDC", "w1", "p1").unwrap();
    let mut state = PositionState::default();
    assert!(state.add(key.clone()));
    assert!(!state.add(key));

    let pair = ("SOL".to_string(), "USDC".to_string());
    assert_eq!(state.remove("w1", "p1"), Some((pair.clone(), false)));
    assert_eq!(state.remove("w1", "p1"), Some((pair, true)));
    assert_eq!(state.remove("w1", "p1"), None);
    assert_eq!(state, PositionState::default());
}
