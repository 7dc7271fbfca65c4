//! Stable per-(pair, user) ordinals for positions.
//!
//! The first position a user opens in a pair gets ordinal 0, the next 1, and
//! so on. Ordinals are never reused while the pair's high-water mark exists.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::bucket_insert;
use crate::storage::key::{join_key, require_component, split_key};
use crate::storage::{Change, StateContainer, StorageEngine, decode_document, encode_document};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey {
    lb_pair: String,
    user: String,
    position: String,
}

impl IndexKey {
    pub fn new(
        lb_pair: impl Into<String>,
        user: impl Into<String>,
        position: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            lb_pair: lb_pair.into(),
            user: user.into(),
            position: position.into(),
        };
        require_component("lb_pair", &key.lb_pair)?;
        require_component("user", &key.user)?;
        require_component("position", &key.position)?;
        Ok(key)
    }

    pub fn lb_pair(&self) -> &str {
        &self.lb_pair
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn position(&self) -> &str {
        &self.position
    }

    #[must_use]
    pub fn to_key_string(&self) -> String {
        join_key(&[&self.lb_pair, &self.user, &self.position])
    }

    pub fn from_key_string(input: &str) -> Result<Self> {
        let [lb_pair, user, position] = split_key::<3>("index", input)?;
        Self::new(lb_pair, user, position)
    }
}

type HighWater = BTreeMap<String, BTreeMap<String, u32>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionIndexState {
    indices: BTreeMap<IndexKey, u32>,
    max_indices: HighWater,
    pair_users: BTreeMap<(String, String), BTreeSet<IndexKey>>,
}

#[derive(Serialize, Deserialize)]
struct PositionIndexDocument {
    version: u32,
    #[serde(default)]
    indices: BTreeMap<String, u32>,
    #[serde(default)]
    max_indices: HighWater,
}

impl PositionIndexState {
    /// Rebuild from primary data. A high-water mark lower than an existing
    /// ordinal is raised so new ordinals never collide.
    #[must_use]
    pub fn from_primary(indices: BTreeMap<IndexKey, u32>, mut max_indices: HighWater) -> Self {
        let mut pair_users = BTreeMap::new();
        for (key, ordinal) in &indices {
            bucket_insert(
                &mut pair_users,
                (key.lb_pair.clone(), key.user.clone()),
                key.clone(),
            );
            let mark = max_indices
                .entry(key.lb_pair.clone())
                .or_default()
                .entry(key.user.clone())
                .or_insert(*ordinal);
            *mark = (*mark).max(*ordinal);
        }
        max_indices.retain(|_, users| !users.is_empty());
        Self {
            indices,
            max_indices,
            pair_users,
        }
    }

    pub fn primary(&self) -> &BTreeMap<IndexKey, u32> {
        &self.indices
    }

    pub fn high_water(&self) -> &HighWater {
        &self.max_indices
    }

    #[must_use]
    pub fn get(&self, key: &IndexKey) -> Option<u32> {
        self.indices.get(key).copied()
    }

    /// Existing ordinal, or the next one for (pair, user).
    pub fn get_or_create(&mut self, key: &IndexKey) -> Result<Change<u32>> {
        if let Some(existing) = self.indices.get(key) {
            return Ok(Change::Unchanged(*existing));
        }
        let next = match self
            .max_indices
            .get(&key.lb_pair)
            .and_then(|users| users.get(&key.user))
        {
            Some(mark) => mark
                .checked_add(1)
                .ok_or_else(|| Error::operation(format!("ordinal space exhausted for {}", key.to_key_string())))?,
            None => 0,
        };
        self.indices.insert(key.clone(), next);
        self.max_indices
            .entry(key.lb_pair.clone())
            .or_default()
            .insert(key.user.clone(), next);
        bucket_insert(
            &mut self.pair_users,
            (key.lb_pair.clone(), key.user.clone()),
            key.clone(),
        );
        Ok(Change::Modified(next))
    }

    /// Drop every ordinal and the high-water mark of (pair, user).
    /// Returns the number of ordinals removed.
    pub fn cleanup(&mut self, lb_pair: &str, user: &str) -> usize {
        let bucket = (lb_pair.to_string(), user.to_string());
        let keys = self.pair_users.remove(&bucket).unwrap_or_default();
        for key in &keys {
            self.indices.remove(key);
        }
        if let Some(users) = self.max_indices.get_mut(lb_pair) {
            users.remove(user);
            if users.is_empty() {
                self.max_indices.remove(lb_pair);
            }
        }
        keys.len()
    }

    fn has_pair_user(&self, lb_pair: &str, user: &str) -> bool {
        self.max_indices
            .get(lb_pair)
            .is_some_and(|users| users.contains_key(user))
            || self
                .pair_users
                .contains_key(&(lb_pair.to_string(), user.to_string()))
    }
}

impl StateContainer for PositionIndexState {
    const STORE: &'static str = "position_index";
    const VERSION: u32 = 1;

    fn serialize(&self) -> Result<Vec<u8>> {
        let doc = PositionIndexDocument {
            version: Self::VERSION,
            indices: self
                .indices
                .iter()
                .map(|(k, i)| (k.to_key_string(), *i))
                .collect(),
            max_indices: self.max_indices.clone(),
        };
        encode_document(Self::STORE, &doc)
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let doc: PositionIndexDocument = decode_document(Self::STORE, Self::VERSION, bytes)?;
        let indices = doc
            .indices
            .into_iter()
            .map(|(k, i)| Ok((IndexKey::from_key_string(&k)?, i)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self::from_primary(indices, doc.max_indices))
    }

    fn record_count(&self) -> usize {
        self.indices.len()
    }
}

pub struct PositionIndexStore {
    engine: StorageEngine<PositionIndexState>,
}

store_lifecycle!(PositionIndexStore, PositionIndexState);

impl PositionIndexStore {
    pub async fn get(&self, key: &IndexKey) -> Option<u32> {
        self.engine.read(|s| s.get(key)).await
    }

    pub async fn get_or_create(&self, key: &IndexKey) -> Result<u32> {
        self.engine.write(|s| s.get_or_create(key)).await
    }

    pub async fn cleanup(&self, lb_pair: &str, user: &str) -> Result<usize> {
        require_component("lb_pair", lb_pair)?;
        require_component("user", user)?;
        self.engine
            .write(|s| {
                if !s.has_pair_user(lb_pair, user) {
                    return Ok(Change::Unchanged(0));
                }
                Ok(Change::Modified(s.cleanup(lb_pair, user)))
            })
            .await
    }
}
