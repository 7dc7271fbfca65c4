//! Per-position performance ledgers.
//!
//! Amounts are integer base units (`i128`) and are written to disk as decimal
//! strings so no precision is lost in MessagePack.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{bucket_insert, bucket_remove};
use crate::Result;
use crate::storage::key::{join_key, parse_int_component, require_component, split_key};
use crate::storage::{Change, StateContainer, StorageEngine, decode_document, encode_document};

/// Serde adapter storing `i128` as a decimal string.
mod decimal_string {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(value: &i128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PerformanceKey {
    user: String,
    session: u64,
    lb_pair: String,
    position: String,
}

impl PerformanceKey {
    pub fn new(
        user: impl Into<String>,
        session: u64,
        lb_pair: impl Into<String>,
        position: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            user: user.into(),
            session,
            lb_pair: lb_pair.into(),
            position: position.into(),
        };
        require_component("user", &key.user)?;
        require_component("lb_pair", &key.lb_pair)?;
        require_component("position", &key.position)?;
        Ok(key)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn lb_pair(&self) -> &str {
        &self.lb_pair
    }

    pub fn position(&self) -> &str {
        &self.position
    }

    #[must_use]
    pub fn to_key_string(&self) -> String {
        join_key(&[
            &self.user,
            &self.session.to_string(),
            &self.lb_pair,
            &self.position,
        ])
    }

    pub fn from_key_string(input: &str) -> Result<Self> {
        let [user, session, lb_pair, position] = split_key::<4>("performance", input)?;
        let session = parse_int_component("performance", input, session)?;
        Self::new(user, session, lb_pair, position)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalance {
    #[serde(with = "decimal_string")]
    pub amount_x: i128,
    #[serde(with = "decimal_string")]
    pub amount_y: i128,
    #[serde(with = "decimal_string")]
    pub value_in_y: i128,
}

impl TokenBalance {
    fn accumulate(&mut self, other: &Self) {
        self.amount_x = self.amount_x.saturating_add(other.amount_x);
        self.amount_y = self.amount_y.saturating_add(other.amount_y);
        self.value_in_y = self.value_in_y.saturating_add(other.value_in_y);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionPerformance {
    #[serde(default)]
    pub deposits: TokenBalance,
    #[serde(default)]
    pub withdrawals: TokenBalance,
    #[serde(default)]
    pub fees_earned: TokenBalance,
}

impl PositionPerformance {
    pub fn accumulate(&mut self, other: &Self) {
        self.deposits.accumulate(&other.deposits);
        self.withdrawals.accumulate(&other.withdrawals);
        self.fees_earned.accumulate(&other.fees_earned);
    }
}

/// session -> lb_pair -> position -> performance
pub type UserPerformance = BTreeMap<u64, BTreeMap<String, BTreeMap<String, PositionPerformance>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerformanceState {
    performances: BTreeMap<PerformanceKey, PositionPerformance>,
    user_sessions: BTreeMap<(String, u64), BTreeSet<PerformanceKey>>,
    session_pairs: BTreeMap<(u64, String), BTreeSet<PerformanceKey>>,
}

#[derive(Serialize, Deserialize)]
struct PerformanceDocument {
    version: u32,
    #[serde(default)]
    performances: BTreeMap<String, PositionPerformance>,
}

impl PerformanceState {
    #[must_use]
    pub fn from_primary(performances: BTreeMap<PerformanceKey, PositionPerformance>) -> Self {
        let mut state = Self::default();
        for key in performances.keys() {
            state.index(key);
        }
        state.performances = performances;
        state
    }

    pub fn primary(&self) -> &BTreeMap<PerformanceKey, PositionPerformance> {
        &self.performances
    }

    fn index(&mut self, key: &PerformanceKey) {
        bucket_insert(
            &mut self.user_sessions,
            (key.user.clone(), key.session),
            key.clone(),
        );
        bucket_insert(
            &mut self.session_pairs,
            (key.session, key.lb_pair.clone()),
            key.clone(),
        );
    }

    /// Insert or overwrite. Returns true when the key is new.
    pub fn update(&mut self, key: PerformanceKey, performance: PositionPerformance) -> bool {
        let is_new = !self.performances.contains_key(&key);
        if is_new {
            self.index(&key);
        }
        self.performances.insert(key, performance);
        is_new
    }

    #[must_use]
    pub fn user_performance(&self, user: &str, session: Option<u64>) -> UserPerformance {
        let mut out = UserPerformance::new();
        for key in self.user_keys(user, session) {
            if let Some(perf) = self.performances.get(key) {
                out.entry(key.session)
                    .or_default()
                    .entry(key.lb_pair.clone())
                    .or_default()
                    .insert(key.position.clone(), *perf);
            }
        }
        out
    }

    #[must_use]
    pub fn user_pair_performance(
        &self,
        user: &str,
        session: u64,
        lb_pair: &str,
    ) -> BTreeMap<String, PositionPerformance> {
        self.session_pairs
            .get(&(session, lb_pair.to_string()))
            .into_iter()
            .flatten()
            .filter(|k| k.user == user)
            .filter_map(|k| self.performances.get(k).map(|p| (k.position.clone(), *p)))
            .collect()
    }

    /// Remove a user's ledgers, optionally limited to one session.
    pub fn cleanup_user(&mut self, user: &str, session: Option<u64>) -> usize {
        let keys: Vec<PerformanceKey> = self.user_keys(user, session).cloned().collect();
        for key in &keys {
            self.performances.remove(key);
            bucket_remove(
                &mut self.user_sessions,
                &(key.user.clone(), key.session),
                key,
            );
            bucket_remove(
                &mut self.session_pairs,
                &(key.session, key.lb_pair.clone()),
                key,
            );
        }
        keys.len()
    }

    fn user_keys<'a>(
        &'a self,
        user: &'a str,
        session: Option<u64>,
    ) -> impl Iterator<Item = &'a PerformanceKey> + 'a {
        let (lo, hi) = match session {
            Some(s) => (s, s),
            None => (u64::MIN, u64::MAX),
        };
        self.user_sessions
            .range((user.to_string(), lo)..=(user.to_string(), hi))
            .flat_map(|(_, keys)| keys.iter())
    }
}

impl StateContainer for PerformanceState {
    const STORE: &'static str = "performance";
    const VERSION: u32 = 1;

    fn serialize(&self) -> Result<Vec<u8>> {
        let doc = PerformanceDocument {
            version: Self::VERSION,
            performances: self
                .performances
                .iter()
                .map(|(k, p)| (k.to_key_string(), *p))
                .collect(),
        };
        encode_document(Self::STORE, &doc)
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let doc: PerformanceDocument = decode_document(Self::STORE, Self::VERSION, bytes)?;
        let performances = doc
            .performances
            .into_iter()
            .map(|(k, p)| Ok((PerformanceKey::from_key_string(&k)?, p)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self::from_primary(performances))
    }

    fn record_count(&self) -> usize {
        self.performances.len()
    }
}

pub struct PerformanceStore {
    engine: StorageEngine<PerformanceState>,
}

store_lifecycle!(PerformanceStore, PerformanceState);

impl PerformanceStore {
    pub async fn update(&self, key: &PerformanceKey, performance: PositionPerformance) -> Result<bool> {
        let key = key.clone();
        self.engine
            .write(move |s| Ok(Change::Modified(s.update(key, performance))))
            .await
    }

    pub async fn user_performance(&self, user: &str, session: Option<u64>) -> UserPerformance {
        self.engine
            .read(|s| s.user_performance(user, session))
            .await
    }

    pub async fn user_pair_performance(
        &self,
        user: &str,
        session: u64,
        lb_pair: &str,
    ) -> BTreeMap<String, PositionPerformance> {
        self.engine
            .read(|s| s.user_pair_performance(user, session, lb_pair))
            .await
    }

    /// Sum of every position of a user in one pair and session.
    pub async fn aggregated(&self, user: &str, session: u64, lb_pair: &str) -> PositionPerformance {
        self.engine
            .read(|s| {
                let mut total = PositionPerformance::default();
                for perf in s.user_pair_performance(user, session, lb_pair).values() {
                    total.accumulate(perf);
                }
                total
            })
            .await
    }

    pub async fn cleanup_user(&self, user: &str, session: Option<u64>) -> Result<usize> {
        require_component("user", user)?;
        self.engine
            .write(|s| {
                let removed = s.cleanup_user(user, session);
                Ok(if removed == 0 {
                    Change::Unchanged(0)
                } else {
                    Change::Modified(removed)
                })
            })
            .await
    }
}
