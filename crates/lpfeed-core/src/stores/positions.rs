//! Reference-counted liquidity positions.
//!
//! Primary data maps a [`PositionKey`] to an open-position count. Three
//! indices are derived from it:
//!
//! - `owner_pool`: (owner, pool) to the keys of that owner in that pool
//! - `token`: token to every key that trades it, on either side
//! - `token_pool_owners`: (token, pool) to owner to the summed count of
//!   that owner's keys
//!
//! Per-token thread records ride along in the same document.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{bucket_insert, bucket_remove};
use crate::Result;
use crate::storage::key::{join_key, require_component, split_key};
use crate::storage::{Change, StateContainer, StorageEngine, decode_document, encode_document};

// =============================================================================
// Keys and records
// =============================================================================

/// One owner's position in one pool of a token pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PositionKey {
    token_x: String,
    token_y: String,
    owner: String,
    pool: String,
}

impl PositionKey {
    pub fn new(
        token_x: impl Into<String>,
        token_y: impl Into<String>,
        owner: impl Into<String>,
        pool: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            token_x: token_x.into(),
            token_y: token_y.into(),
            owner: owner.into(),
            pool: pool.into(),
        };
        require_component("token_x", &key.token_x)?;
        require_component("token_y", &key.token_y)?;
        require_component("owner", &key.owner)?;
        require_component("pool", &key.pool)?;
        Ok(key)
    }

    pub fn token_x(&self) -> &str {
        &self.token_x
    }

    pub fn token_y(&self) -> &str {
        &self.token_y
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Distinct tokens of the pair.
    fn tokens(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.token_x.as_str())
            .chain((self.token_y != self.token_x).then_some(self.token_y.as_str()))
    }

    #[must_use]
    pub fn to_key_string(&self) -> String {
        join_key(&[&self.token_x, &self.token_y, &self.owner, &self.pool])
    }

    pub fn from_key_string(input: &str) -> Result<Self> {
        let [x, y, owner, pool] = split_key::<4>("position", input)?;
        Self::new(x, y, owner, pool)
    }
}

/// Chat thread attached to a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub thread_id: u64,
    #[serde(default)]
    pub needs_update: bool,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl ThreadRecord {
    #[must_use]
    pub fn new(thread_id: u64) -> Self {
        Self {
            thread_id,
            needs_update: false,
            last_updated: None,
        }
    }
}

/// Token pair of a removed position and whether its count reached zero.
pub type Removal = (Option<(String, String)>, bool);

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionState {
    positions: BTreeMap<PositionKey, u64>,
    owner_pool: BTreeMap<(String, String), BTreeSet<PositionKey>>,
    token: BTreeMap<String, BTreeSet<PositionKey>>,
    token_pool_owners: BTreeMap<(String, String), BTreeMap<String, u64>>,
    threads: BTreeMap<String, ThreadRecord>,
}

#[derive(Serialize, Deserialize)]
struct PositionDocument {
    version: u32,
    #[serde(default)]
    positions: BTreeMap<String, u64>,
    #[serde(default)]
    threads: BTreeMap<String, ThreadRecord>,
}

impl PositionState {
    /// Rebuild every index from primary data. Zero counts are dropped.
    #[must_use]
    pub fn from_primary(
        positions: BTreeMap<PositionKey, u64>,
        threads: BTreeMap<String, ThreadRecord>,
    ) -> Self {
        let mut state = Self {
            threads,
            ..Self::default()
        };
        for (key, count) in positions {
            if count == 0 {
                continue;
            }
            state.index_key(&key);
            for token in key.tokens() {
                *state.owner_counts(token, &key.pool).entry(key.owner.clone()).or_insert(0) += count;
            }
            state.positions.insert(key, count);
        }
        state
    }

    pub fn primary(&self) -> &BTreeMap<PositionKey, u64> {
        &self.positions
    }

    pub fn threads(&self) -> &BTreeMap<String, ThreadRecord> {
        &self.threads
    }

    fn index_key(&mut self, key: &PositionKey) {
        bucket_insert(
            &mut self.owner_pool,
            (key.owner.clone(), key.pool.clone()),
            key.clone(),
        );
        for token in key.tokens() {
            bucket_insert(&mut self.token, token.to_string(), key.clone());
        }
    }

    fn owner_counts(&mut self, token: &str, pool: &str) -> &mut BTreeMap<String, u64> {
        self.token_pool_owners
            .entry((token.to_string(), pool.to_string()))
            .or_default()
    }

    fn decrement_owner(&mut self, token: &str, pool: &str, owner: &str) {
        let bucket = (token.to_string(), pool.to_string());
        let Some(owners) = self.token_pool_owners.get_mut(&bucket) else {
            return;
        };
        if let Some(count) = owners.get_mut(owner) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                owners.remove(owner);
            }
        }
        if owners.is_empty() {
            self.token_pool_owners.remove(&bucket);
        }
    }

    /// Increment the count for `key`. Returns true on first insertion.
    pub fn add(&mut self, key: PositionKey) -> bool {
        let count = self.positions.entry(key.clone()).or_insert(0);
        *count += 1;
        let is_new = *count == 1;
        if is_new {
            self.index_key(&key);
        }
        for token in key.tokens() {
            *self.owner_counts(token, &key.pool).entry(key.owner.clone()).or_insert(0) += 1;
        }
        is_new
    }

    /// Decrement the smallest key matching (owner, pool).
    ///
    /// Returns `None` when nothing matched and state is untouched.
    pub fn remove(&mut self, owner: &str, pool: &str) -> Option<((String, String), bool)> {
        let bucket = (owner.to_string(), pool.to_string());
        let key = self.owner_pool.get(&bucket)?.first()?.clone();

        let count = match self.positions.get_mut(&key) {
            Some(count) if *count > 0 => count,
            _ => {
                warn!(
                    store = "positions",
                    owner,
                    pool,
                    key = %key.to_key_string(),
                    "Index references a position with no open count; ignoring"
                );
                return None;
            }
        };
        *count -= 1;
        let deleted = *count == 0;

        if deleted {
            self.positions.remove(&key);
            bucket_remove(&mut self.owner_pool, &bucket, &key);
            for token in key.tokens() {
                bucket_remove(&mut self.token, &token.to_string(), &key);
            }
        }
        for token in key.tokens() {
            self.decrement_owner(token, &key.pool, &key.owner);
        }
        Some(((key.token_x, key.token_y), deleted))
    }

    /// Sum of counts for an owner across every pool of a token pair.
    #[must_use]
    pub fn position_count(&self, token_x: &str, token_y: &str, owner: &str) -> u64 {
        self.token
            .get(token_x)
            .into_iter()
            .flatten()
            .filter(|k| k.token_x == token_x && k.token_y == token_y && k.owner == owner)
            .filter_map(|k| self.positions.get(k))
            .sum()
    }

    #[must_use]
    pub fn unique_owners(&self, token: &str) -> usize {
        self.token
            .get(token)
            .into_iter()
            .flatten()
            .map(|k| k.owner.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    #[must_use]
    pub fn token_pools(&self, token: &str) -> BTreeSet<String> {
        self.token
            .get(token)
            .into_iter()
            .flatten()
            .map(|k| k.pool.clone())
            .collect()
    }

    /// Owners and summed counts, sorted by owner.
    #[must_use]
    pub fn pool_users(&self, token: &str, pool: &str) -> Vec<(String, u64)> {
        self.token_pool_owners
            .get(&(token.to_string(), pool.to_string()))
            .map(|owners| owners.iter().map(|(o, c)| (o.clone(), *c)).collect())
            .unwrap_or_default()
    }
}

impl StateContainer for PositionState {
    const STORE: &'static str = "positions";
    const VERSION: u32 = 1;

    fn serialize(&self) -> Result<Vec<u8>> {
        let doc = PositionDocument {
            version: Self::VERSION,
            positions: self
                .positions
                .iter()
                .map(|(k, c)| (k.to_key_string(), *c))
                .collect(),
            threads: self.threads.clone(),
        };
        encode_document(Self::STORE, &doc)
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let doc: PositionDocument = decode_document(Self::STORE, Self::VERSION, bytes)?;
        let positions = doc
            .positions
            .into_iter()
            .map(|(k, c)| Ok((PositionKey::from_key_string(&k)?, c)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self::from_primary(positions, doc.threads))
    }

    fn record_count(&self) -> usize {
        self.positions.len()
    }
}

// =============================================================================
// Store
// =============================================================================

pub struct PositionStore {
    engine: StorageEngine<PositionState>,
}

store_lifecycle!(PositionStore, PositionState);

impl PositionStore {
    /// Open (or reopen) a position. Returns true when the key is new.
    pub async fn add(&self, key: &PositionKey) -> Result<bool> {
        let key = key.clone();
        self.engine
            .write(move |s| Ok(Change::Modified(s.add(key))))
            .await
    }

    /// Close one position of `owner` in `pool`.
    pub async fn remove(&self, owner: &str, pool: &str) -> Result<Removal> {
        require_component("owner", owner)?;
        require_component("pool", pool)?;
        self.engine
            .write(|s| {
                Ok(match s.remove(owner, pool) {
                    Some((pair, deleted)) => Change::Modified((Some(pair), deleted)),
                    None => Change::Unchanged((None, false)),
                })
            })
            .await
    }

    pub async fn position_count(&self, token_x: &str, token_y: &str, owner: &str) -> u64 {
        self.engine
            .read(|s| s.position_count(token_x, token_y, owner))
            .await
    }

    pub async fn unique_owners(&self, token: &str) -> usize {
        self.engine.read(|s| s.unique_owners(token)).await
    }

    pub async fn token_pools(&self, token: &str) -> BTreeSet<String> {
        self.engine.read(|s| s.token_pools(token)).await
    }

    pub async fn pool_users(&self, token: &str, pool: &str) -> Vec<(String, u64)> {
        self.engine.read(|s| s.pool_users(token, pool)).await
    }

    /// Copy of the primary mapping.
    pub async fn snapshot(&self) -> BTreeMap<PositionKey, u64> {
        self.engine.read(|s| s.positions.clone()).await
    }

    pub async fn set_thread(&self, token: &str, record: ThreadRecord) -> Result<()> {
        require_component("token", token)?;
        self.engine
            .write(|s| {
                s.threads.insert(token.to_string(), record);
                Ok(Change::Modified(()))
            })
            .await
    }

    pub async fn remove_thread(&self, token: &str) -> Result<bool> {
        self.engine
            .write(|s| {
                Ok(match s.threads.remove(token) {
                    Some(_) => Change::Modified(true),
                    None => Change::Unchanged(false),
                })
            })
            .await
    }

    pub async fn thread(&self, token: &str) -> Option<ThreadRecord> {
        self.engine.read(|s| s.threads.get(token).cloned()).await
    }

    /// Flag a thread for refresh. Returns false when no thread exists.
    pub async fn update_thread_status(
        &self,
        token: &str,
        needs_update: bool,
        last_updated: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.engine
            .write(|s| {
                let Some(record) = s.threads.get_mut(token) else {
                    warn!(store = "positions", token, "No thread to update");
                    return Ok(Change::Unchanged(false));
                };
                record.needs_update = needs_update;
                if let Some(at) = last_updated {
                    record.last_updated = Some(at);
                }
                Ok(Change::Modified(true))
            })
            .await
    }

    pub async fn threads(&self) -> BTreeMap<String, ThreadRecord> {
        self.engine.read(|s| s.threads.clone()).await
    }
}
