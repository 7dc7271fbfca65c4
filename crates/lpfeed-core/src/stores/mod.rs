//! Domain stores built on [`StorageEngine`](crate::storage::StorageEngine).
//!
//! Every store pairs a composite key type with a state container that owns
//! the primary mapping and its derived indices. Indices are rebuilt from the
//! primary mapping on load (`from_primary`) and maintained incrementally by
//! each mutator. Emptied index buckets are always pruned.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use crate::Result;
use crate::config::StorageSettings;

/// Generates the lifecycle surface shared by every store wrapper.
macro_rules! store_lifecycle {
    ($store:ident, $state:ty) => {
        impl $store {
            #[must_use]
            pub fn new(config: $crate::config::StorageConfig) -> Self {
                Self {
                    engine: $crate::storage::StorageEngine::new(config),
                }
            }

            /// Load from disk and start background saving.
            pub async fn initialize(&self) -> $crate::Result<()> {
                self.engine.initialize().await
            }

            /// Final save and shutdown.
            pub async fn close(&self) -> $crate::Result<()> {
                self.engine.close().await
            }

            /// Save now if anything changed.
            pub async fn flush(&self) -> $crate::Result<bool> {
                self.engine.flush().await
            }

            pub fn engine(&self) -> &$crate::storage::StorageEngine<$state> {
                &self.engine
            }

            pub async fn record_count(&self) -> usize {
                self.engine
                    .read(|s| $crate::storage::StateContainer::record_count(s))
                    .await
            }
        }
    };
}

pub mod performance;
pub mod position_index;
pub mod positions;
pub mod sessions;
pub mod token_pairs;
pub mod votes;
pub mod wallets;

pub use performance::{PerformanceKey, PerformanceStore, PositionPerformance, TokenBalance};
pub use position_index::{IndexKey, PositionIndexStore};
pub use positions::{PositionKey, PositionStore, ThreadRecord};
pub use sessions::{SessionKey, SessionRecord, SessionStore};
pub use token_pairs::{TokenPair, TokenPairStore};
pub use votes::{CastOutcome, VoteKey, VoteRecord, VoteStore};
pub use wallets::{WalletKey, WalletStore};

// =============================================================================
// Index bucket helpers
// =============================================================================

pub(crate) fn bucket_insert<K: Ord, V: Ord>(index: &mut BTreeMap<K, BTreeSet<V>>, key: K, value: V) {
    index.entry(key).or_default().insert(value);
}

/// Remove `value` from the bucket at `key`, pruning the bucket when emptied.
pub(crate) fn bucket_remove<K: Ord, V: Ord>(index: &mut BTreeMap<K, BTreeSet<V>>, key: &K, value: &V) {
    if let Some(bucket) = index.get_mut(key) {
        bucket.remove(value);
        if bucket.is_empty() {
            index.remove(key);
        }
    }
}

// =============================================================================
// StoreSet
// =============================================================================

/// All domain stores of one data directory.
pub struct StoreSet {
    pub positions: Arc<PositionStore>,
    pub position_index: Arc<PositionIndexStore>,
    pub sessions: Arc<SessionStore>,
    pub wallets: Arc<WalletStore>,
    pub token_pairs: Arc<TokenPairStore>,
    pub performance: Arc<PerformanceStore>,
    pub votes: Arc<VoteStore>,
}

/// Per-store primary record counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub positions: usize,
    pub position_index: usize,
    pub sessions: usize,
    pub wallets: usize,
    pub token_pairs: usize,
    pub performance: usize,
    pub votes: usize,
}

impl StoreSet {
    /// Build (but do not load) every store under `settings.data_dir`.
    pub fn open(settings: &StorageSettings) -> Result<Self> {
        Ok(Self {
            positions: Arc::new(PositionStore::new(settings.for_store("positions")?)),
            position_index: Arc::new(PositionIndexStore::new(
                settings.for_store("position_index")?,
            )),
            sessions: Arc::new(SessionStore::new(settings.for_store("sessions")?)),
            wallets: Arc::new(WalletStore::new(settings.for_store("wallets")?)),
            token_pairs: Arc::new(TokenPairStore::new(settings.for_store("token_pairs")?)),
            performance: Arc::new(PerformanceStore::new(settings.for_store("performance")?)),
            votes: Arc::new(VoteStore::new(settings.for_store("votes")?)),
        })
    }

    pub async fn initialize(&self) -> Result<()> {
        self.positions.initialize().await?;
        self.position_index.initialize().await?;
        self.sessions.initialize().await?;
        self.wallets.initialize().await?;
        self.token_pairs.initialize().await?;
        self.performance.initialize().await?;
        self.votes.initialize().await?;
        Ok(())
    }

    /// Close every store, returning the first failure after attempting all.
    pub async fn close(&self) -> Result<()> {
        let results = [
            self.positions.close().await,
            self.position_index.close().await,
            self.sessions.close().await,
            self.wallets.close().await,
            self.token_pairs.close().await,
            self.performance.close().await,
            self.votes.close().await,
        ];
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    pub async fn counts(&self) -> StoreCounts {
        StoreCounts {
            positions: self.positions.record_count().await,
            position_index: self.position_index.record_count().await,
            sessions: self.sessions.record_count().await,
            wallets: self.wallets.record_count().await,
            token_pairs: self.token_pairs.record_count().await,
            performance: self.performance.record_count().await,
            votes: self.votes.record_count().await,
        }
    }
}
