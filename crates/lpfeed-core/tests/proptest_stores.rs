//! Property-based tests for the remaining store states.
//!
//! Each state is driven by random mutations; the incrementally maintained
//! indices must equal a rebuild from primary data, and the MessagePack
//! round-trip must be lossless.

use proptest::prelude::*;

use lpfeed_core::storage::{Change, StateContainer};
use lpfeed_core::stores::performance::PerformanceState;
use lpfeed_core::stores::position_index::PositionIndexState;
use lpfeed_core::stores::token_pairs::TokenPairState;
use lpfeed_core::stores::wallets::WalletState;
use lpfeed_core::stores::{IndexKey, PerformanceKey, PositionPerformance, TokenBalance, TokenPair, WalletKey};

// =============================================================================
// Strategies
// =============================================================================

fn arb_name(prefix: &'static str, n: usize) -> impl Strategy<Value = String> + Clone {
    (0..n).prop_map(move |i| format!("{prefix}{i}"))
}

#[derive(Debug, Clone)]
enum WalletOp {
    Add(WalletKey, bool),
    Remove(WalletKey),
}

fn arb_wallet_op() -> impl Strategy<Value = WalletOp> {
    let key = (arb_name("u", 3), arb_name("w", 4)).prop_map(|(u, w)| WalletKey::new(u, w).unwrap());
    prop_oneof![
        3 => (key.clone(), any::<bool>()).prop_map(|(k, anon)| WalletOp::Add(k, anon)),
        1 => key.prop_map(WalletOp::Remove),
    ]
}

#[derive(Debug, Clone)]
enum IndexOp {
    Create(IndexKey),
    Cleanup(String, String),
}

fn arb_index_op() -> impl Strategy<Value = IndexOp> {
    prop_oneof![
        4 => (arb_name("P", 2), arb_name("u", 2), arb_name("pos", 4))
            .prop_map(|(p, u, pos)| IndexOp::Create(IndexKey::new(p, u, pos).unwrap())),
        1 => (arb_name("P", 2), arb_name("u", 2)).prop_map(|(p, u)| IndexOp::Cleanup(p, u)),
    ]
}

fn arb_amount() -> impl Strategy<Value = i128> {
    prop_oneof![
        -1_000_000i128..1_000_000i128,
        Just(i128::MAX),
        Just(i128::MIN),
    ]
}

fn arb_balance() -> impl Strategy<Value = TokenBalance> {
    (arb_amount(), arb_amount(), arb_amount()).prop_map(|(amount_x, amount_y, value_in_y)| TokenBalance {
        amount_x,
        amount_y,
        value_in_y,
    })
}

fn arb_performance() -> impl Strategy<Value = (PerformanceKey, PositionPerformance)> {
    (
        arb_name("u", 2),
        0u64..3,
        arb_name("P", 2),
        arb_name("pos", 3),
        arb_balance(),
        arb_balance(),
        arb_balance(),
    )
        .prop_map(|(u, s, p, pos, deposits, withdrawals, fees_earned)| {
            (
                PerformanceKey::new(u, s, p, pos).unwrap(),
                PositionPerformance {
                    deposits,
                    withdrawals,
                    fees_earned,
                },
            )
        })
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn wallet_indices_match_rebuild(ops in prop::collection::vec(arb_wallet_op(), 0..48)) {
        let mut state = WalletState::default();
        for op in ops {
            match op {
                // conflicting owners are rejected without a trace
                WalletOp::Add(key, anon) => { let _ = state.add(&key, anon); }
                WalletOp::Remove(key) => { state.remove(&key); }
            }
        }
        let rebuilt = WalletState::from_primary(state.primary().clone()).unwrap();
        prop_assert_eq!(&state, &rebuilt);
        let restored = WalletState::deserialize(&state.serialize().unwrap()).unwrap();
        prop_assert_eq!(state, restored);
    }

    #[test]
    fn token_pair_indices_match_rebuild(
        ops in prop::collection::vec((arb_name("P", 4), arb_name("T", 3), arb_name("T", 3), any::<bool>()), 0..48)
    ) {
        let mut state = TokenPairState::default();
        for (pool, x, y, remove) in ops {
            if remove {
                state.remove_pair(&pool);
            } else {
                state.set_tokens(&pool, TokenPair::new(x, y).unwrap());
            }
        }
        prop_assert_eq!(&state, &TokenPairState::from_primary(state.primary().clone()));
        let restored = TokenPairState::deserialize(&state.serialize().unwrap()).unwrap();
        prop_assert_eq!(state, restored);
    }

    #[test]
    fn ordinals_are_unique_per_pair_user(ops in prop::collection::vec(arb_index_op(), 0..48)) {
        let mut state = PositionIndexState::default();
        for op in ops {
            match op {
                IndexOp::Create(key) => {
                    let ordinal = match state.get_or_create(&key).unwrap() {
                        Change::Modified(o) | Change::Unchanged(o) => o,
                    };
                    prop_assert_eq!(state.get(&key), Some(ordinal));
                }
                IndexOp::Cleanup(pool, user) => { state.cleanup(&pool, &user); }
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for (key, ordinal) in state.primary() {
            prop_assert!(seen.insert((key.lb_pair().to_string(), key.user().to_string(), *ordinal)));
        }
        let rebuilt = PositionIndexState::from_primary(state.primary().clone(), state.high_water().clone());
        prop_assert_eq!(&state, &rebuilt);
        let restored = PositionIndexState::deserialize(&state.serialize().unwrap()).unwrap();
        prop_assert_eq!(state, restored);
    }

    #[test]
    fn performance_round_trip(updates in prop::collection::vec(arb_performance(), 0..32)) {
        let mut state = PerformanceState::default();
        for (key, performance) in updates {
            state.update(key, performance);
        }
        prop_assert_eq!(&state, &PerformanceState::from_primary(state.primary().clone()));
        let restored = PerformanceState::deserialize(&state.serialize().unwrap()).unwrap();
        prop_assert_eq!(state, restored);
    }
}
