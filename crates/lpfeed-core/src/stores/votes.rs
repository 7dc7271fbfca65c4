//! Outcome votes on messages and per-user standings.
//!
//! Scoring rules live with the caller: [`VoteStore::resolve`] takes a scorer
//! that maps a message's votes to points, and applies the result atomically.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::{bucket_insert, bucket_remove};
use crate::error::ValidationError;
use crate::storage::key::{join_key, parse_int_component, require_positive, split_key};
use crate::storage::{Change, StateContainer, StorageEngine, decode_document, encode_document};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VoteKey {
    message_id: u64,
    user_id: u64,
}

impl VoteKey {
    pub fn new(message_id: u64, user_id: u64) -> Result<Self> {
        require_positive("message_id", message_id)?;
        require_positive("user_id", user_id)?;
        Ok(Self {
            message_id,
            user_id,
        })
    }

    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    #[must_use]
    pub fn to_key_string(&self) -> String {
        join_key(&[&self.message_id.to_string(), &self.user_id.to_string()])
    }

    pub fn from_key_string(input: &str) -> Result<Self> {
        let [message_id, user_id] = split_key::<2>("vote", input)?;
        Self::new(
            parse_int_component("vote", input, message_id)?,
            parse_int_component("vote", input, user_id)?,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub choice: String,
    pub cast_at: DateTime<Utc>,
    pub weight: f64,
    #[serde(default)]
    pub points: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub votable: bool,
    pub owner_id: u64,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub points_settled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    #[serde(default)]
    pub total_points: f64,
    #[serde(default)]
    pub correct: u32,
    #[serde(default)]
    pub incorrect: u32,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl UserStats {
    #[must_use]
    pub fn accuracy(&self) -> f64 {
        let total = self.correct + self.incorrect;
        if total == 0 {
            0.0
        } else {
            f64::from(self.correct) / f64::from(total)
        }
    }
}

/// Result of [`VoteStore::cast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CastOutcome {
    Accepted,
    UnknownMessage,
    Closed,
    WindowElapsed,
    AlreadyVoted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoteDetail {
    pub user_id: u64,
    pub choice: String,
    pub weight: f64,
    pub points: Option<f64>,
    pub cast_at: DateTime<Utc>,
    pub is_correct: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageStats {
    pub total_votes: usize,
    pub open: bool,
    pub outcome: Option<String>,
    pub is_final: bool,
    pub distribution: BTreeMap<String, usize>,
    pub average_weight: f64,
    pub total_points: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoteState {
    votes: BTreeMap<VoteKey, VoteRecord>,
    messages: BTreeMap<u64, MessageRecord>,
    user_stats: BTreeMap<u64, UserStats>,
    message_votes: BTreeMap<u64, BTreeSet<VoteKey>>,
    user_votes: BTreeMap<u64, BTreeSet<VoteKey>>,
}

#[derive(Serialize, Deserialize)]
struct VoteDocument {
    version: u32,
    #[serde(default)]
    votes: BTreeMap<String, VoteRecord>,
    #[serde(default)]
    messages: BTreeMap<u64, MessageRecord>,
    #[serde(default)]
    user_stats: BTreeMap<u64, UserStats>,
}

impl VoteState {
    #[must_use]
    pub fn from_primary(
        votes: BTreeMap<VoteKey, VoteRecord>,
        messages: BTreeMap<u64, MessageRecord>,
        user_stats: BTreeMap<u64, UserStats>,
    ) -> Self {
        let mut state = Self {
            messages,
            user_stats,
            ..Self::default()
        };
        for key in votes.keys() {
            state.index(*key);
        }
        state.votes = votes;
        state
    }

    pub fn votes(&self) -> &BTreeMap<VoteKey, VoteRecord> {
        &self.votes
    }

    pub fn messages(&self) -> &BTreeMap<u64, MessageRecord> {
        &self.messages
    }

    fn index(&mut self, key: VoteKey) {
        bucket_insert(&mut self.message_votes, key.message_id, key);
        bucket_insert(&mut self.user_votes, key.user_id, key);
    }

    pub fn open_message(&mut self, message_id: u64, owner_id: u64, now: DateTime<Utc>) -> bool {
        let record = MessageRecord {
            opened_at: now,
            votable: true,
            owner_id,
            outcome: None,
            is_final: false,
            points_settled: false,
        };
        self.messages.insert(message_id, record).is_none()
    }

    pub fn cast(
        &mut self,
        key: VoteKey,
        choice: &str,
        weight: f64,
        now: DateTime<Utc>,
        window: TimeDelta,
    ) -> CastOutcome {
        let Some(message) = self.messages.get(&key.message_id) else {
            return CastOutcome::UnknownMessage;
        };
        if !message.votable {
            return CastOutcome::Closed;
        }
        if now - message.opened_at > window {
            return CastOutcome::WindowElapsed;
        }
        if self.votes.contains_key(&key) {
            return CastOutcome::AlreadyVoted;
        }
        self.votes.insert(
            key,
            VoteRecord {
                choice: choice.to_string(),
                cast_at: now,
                weight,
                points: None,
            },
        );
        self.index(key);
        CastOutcome::Accepted
    }

    fn message_vote_map(&self, message_id: u64) -> BTreeMap<VoteKey, VoteRecord> {
        self.message_votes
            .get(&message_id)
            .into_iter()
            .flatten()
            .filter_map(|k| self.votes.get(k).map(|v| (*k, v.clone())))
            .collect()
    }

    /// Record an outcome. A final outcome settles points through `scorer`.
    ///
    /// Returns `Ok(false)` for an unknown or already settled message. Scores
    /// are checked before anything is written.
    pub fn resolve<F>(
        &mut self,
        message_id: u64,
        outcome: &str,
        is_final: bool,
        now: DateTime<Utc>,
        scorer: F,
    ) -> Result<bool>
    where
        F: FnOnce(&str, &BTreeMap<VoteKey, VoteRecord>) -> BTreeMap<VoteKey, f64>,
    {
        match self.messages.get(&message_id) {
            None => return Ok(false),
            Some(m) if m.is_final && m.points_settled => return Ok(false),
            Some(_) => {}
        }

        let scores = if is_final {
            let votes = self.message_vote_map(message_id);
            let scores = scorer(outcome, &votes);
            if let Some((key, points)) = scores.iter().find(|(_, p)| !p.is_finite()) {
                return Err(Error::operation(format!(
                    "scorer produced non-finite points {points} for vote {}",
                    key.to_key_string()
                )));
            }
            Some((votes, scores))
        } else {
            None
        };

        if let Some((votes, scores)) = scores {
            for (key, vote) in votes {
                let points = scores.get(&key).copied().unwrap_or(0.0);
                if let Some(record) = self.votes.get_mut(&key) {
                    record.points = Some(points);
                }
                let stats = self.user_stats.entry(key.user_id).or_default();
                stats.total_points += points;
                if vote.choice == outcome {
                    stats.correct += 1;
                } else {
                    stats.incorrect += 1;
                }
                stats.last_updated = Some(now);
            }
        }

        if let Some(message) = self.messages.get_mut(&message_id) {
            message.outcome = Some(outcome.to_string());
            message.is_final = is_final;
            message.points_settled = is_final;
        }
        Ok(true)
    }

    /// Drop messages opened before `cutoff` with all of their votes.
    pub fn cleanup_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let old: Vec<u64> = self
            .messages
            .iter()
            .filter(|(_, m)| m.opened_at < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &old {
            for key in self.message_votes.remove(id).unwrap_or_default() {
                self.votes.remove(&key);
                bucket_remove(&mut self.user_votes, &key.user_id, &key);
            }
            self.messages.remove(id);
        }
        old.len()
    }

    #[must_use]
    pub fn leaderboard(&self, limit: usize) -> Vec<(u64, UserStats)> {
        let mut ranked: Vec<(u64, UserStats)> = self
            .user_stats
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();
        ranked.sort_by(|a, b| b.1.total_points.total_cmp(&a.1.total_points).then(a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }

    #[must_use]
    pub fn vote_details(&self, message_id: u64) -> Vec<VoteDetail> {
        let outcome = self
            .messages
            .get(&message_id)
            .and_then(|m| m.outcome.as_deref());
        self.message_vote_map(message_id)
            .into_iter()
            .map(|(key, vote)| VoteDetail {
                user_id: key.user_id,
                is_correct: outcome.map(|o| o == vote.choice),
                choice: vote.choice,
                weight: vote.weight,
                points: vote.points,
                cast_at: vote.cast_at,
            })
            .collect()
    }

    #[must_use]
    pub fn message_stats(&self, message_id: u64) -> Option<MessageStats> {
        let message = self.messages.get(&message_id)?;
        let votes = self.message_vote_map(message_id);
        let mut distribution = BTreeMap::new();
        for vote in votes.values() {
            *distribution.entry(vote.choice.clone()).or_insert(0) += 1;
        }
        let total_weight: f64 = votes.values().map(|v| v.weight).sum();
        Some(MessageStats {
            total_votes: votes.len(),
            open: message.votable,
            outcome: message.outcome.clone(),
            is_final: message.is_final,
            distribution,
            average_weight: if votes.is_empty() {
                0.0
            } else {
                total_weight / votes.len() as f64
            },
            total_points: votes.values().filter_map(|v| v.points).sum(),
        })
    }
}

impl StateContainer for VoteState {
    const STORE: &'static str = "votes";
    const VERSION: u32 = 1;

    fn serialize(&self) -> Result<Vec<u8>> {
        let doc = VoteDocument {
            version: Self::VERSION,
            votes: self
                .votes
                .iter()
                .map(|(k, v)| (k.to_key_string(), v.clone()))
                .collect(),
            messages: self.messages.clone(),
            user_stats: self.user_stats.clone(),
        };
        encode_document(Self::STORE, &doc)
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let doc: VoteDocument = decode_document(Self::STORE, Self::VERSION, bytes)?;
        let votes = doc
            .votes
            .into_iter()
            .map(|(k, v)| Ok((VoteKey::from_key_string(&k)?, v)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self::from_primary(votes, doc.messages, doc.user_stats))
    }

    fn record_count(&self) -> usize {
        self.votes.len()
    }
}

pub struct VoteStore {
    engine: StorageEngine<VoteState>,
}

store_lifecycle!(VoteStore, VoteState);

impl VoteStore {
    /// Open a message for voting, replacing any earlier record.
    pub async fn open_message(&self, message_id: u64, owner_id: u64, now: DateTime<Utc>) -> Result<bool> {
        require_positive("message_id", message_id)?;
        self.engine
            .write(|s| Ok(Change::Modified(s.open_message(message_id, owner_id, now))))
            .await
    }

    /// Stop accepting votes on a message.
    pub async fn close_message(&self, message_id: u64) -> Result<bool> {
        self.engine
            .write(|s| match s.messages.get_mut(&message_id) {
                Some(m) if m.votable => {
                    m.votable = false;
                    Ok(Change::Modified(true))
                }
                _ => Ok(Change::Unchanged(false)),
            })
            .await
    }

    pub async fn cast(
        &self,
        key: VoteKey,
        choice: &str,
        weight: f64,
        now: DateTime<Utc>,
        window: TimeDelta,
    ) -> Result<CastOutcome> {
        if choice.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "choice" }.into());
        }
        if !(weight.is_finite() && weight > 0.0) {
            return Err(ValidationError::NonPositive {
                field: "weight",
                value: weight.to_string(),
            }
            .into());
        }
        self.engine
            .write(|s| {
                let outcome = s.cast(key, choice, weight, now, window);
                Ok(if outcome == CastOutcome::Accepted {
                    Change::Modified(outcome)
                } else {
                    Change::Unchanged(outcome)
                })
            })
            .await
    }

    pub async fn resolve<F>(
        &self,
        message_id: u64,
        outcome: &str,
        is_final: bool,
        now: DateTime<Utc>,
        scorer: F,
    ) -> Result<bool>
    where
        F: FnOnce(&str, &BTreeMap<VoteKey, VoteRecord>) -> BTreeMap<VoteKey, f64>,
    {
        if outcome.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "outcome" }.into());
        }
        self.engine
            .write(|s| {
                Ok(if s.resolve(message_id, outcome, is_final, now, scorer)? {
                    Change::Modified(true)
                } else {
                    Change::Unchanged(false)
                })
            })
            .await
    }

    pub async fn user_stats(&self, user_id: u64) -> UserStats {
        self.engine
            .read(|s| s.user_stats.get(&user_id).cloned().unwrap_or_default())
            .await
    }

    pub async fn leaderboard(&self, limit: usize) -> Vec<(u64, UserStats)> {
        self.engine.read(|s| s.leaderboard(limit)).await
    }

    pub async fn vote_details(&self, message_id: u64) -> Vec<VoteDetail> {
        self.engine.read(|s| s.vote_details(message_id)).await
    }

    pub async fn message_stats(&self, message_id: u64) -> Option<MessageStats> {
        self.engine.read(|s| s.message_stats(message_id)).await
    }

    pub async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.engine
            .write(|s| {
                let removed = s.cleanup_before(cutoff);
                Ok(if removed == 0 {
                    Change::Unchanged(0)
                } else {
                    Change::Modified(removed)
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn vk(message: u64, user: u64) -> VoteKey {
        VoteKey::new(message, user).unwrap()
    }

    /// Correct voters share +N, wrong voters lose a flat 1.
    fn flat_scorer(outcome: &str, votes: &BTreeMap<VoteKey, VoteRecord>) -> BTreeMap<VoteKey, f64> {
        let winners = votes.values().filter(|v| v.choice == outcome).count().max(1) as f64;
        votes
            .iter()
            .map(|(k, v)| {
                let points = if v.choice == outcome {
                    votes.len() as f64 / winners
                } else {
                    -1.0
                };
                (*k, points)
            })
            .collect()
    }

    #[test]
    fn key_rules() {
        assert!(VoteKey::new(0, 1).is_err());
        assert!(VoteKey::new(1, 0).is_err());
        assert_eq!(vk(12, 7).to_key_string(), "12:7");
        assert_eq!(VoteKey::from_key_string("12:7").unwrap(), vk(12, 7));
        assert!(VoteKey::from_key_string("12:x").is_err());
        assert!(VoteKey::from_key_string("0:7").is_err());
    }

    #[test]
    fn cast_rejections() {
        let now = Utc::now();
        let window = TimeDelta::minutes(2);
        let mut state = VoteState::default();
        assert_eq!(state.cast(vk(1, 1), "up", 1.0, now, window), CastOutcome::UnknownMessage);

        state.open_message(1, 99, now);
        assert_eq!(state.cast(vk(1, 1), "up", 1.0, now, window), CastOutcome::Accepted);
        assert_eq!(state.cast(vk(1, 1), "down", 1.0, now, window), CastOutcome::AlreadyVoted);
        assert_eq!(
            state.cast(vk(1, 2), "up", 1.0, now + TimeDelta::minutes(3), window),
            CastOutcome::WindowElapsed
        );

        state.messages.get_mut(&1).unwrap().votable = false;
        assert_eq!(state.cast(vk(1, 3), "up", 1.0, now, window), CastOutcome::Closed);
    }

    #[test]
    fn final_resolution_settles_once() {
        let now = Utc::now();
        let window = TimeDelta::minutes(2);
        let mut state = VoteState::default();
        state.open_message(5, 99, now);
        state.cast(vk(5, 1), "up", 1.0, now, window);
        state.cast(vk(5, 2), "up", 0.5, now, window);
        state.cast(vk(5, 3), "down", 1.0, now, window);

        assert!(state.resolve(5, "up", true, now, flat_scorer).unwrap());
        assert!(!state.resolve(5, "down", true, now, flat_scorer).unwrap());
        assert!(!state.resolve(404, "up", true, now, flat_scorer).unwrap());

        let board = state.leaderboard(10);
        assert_eq!(board[0].0, 1);
        assert!((board[0].1.total_points - 1.5).abs() < f64::EPSILON);
        assert_eq!(board[2].0, 3);
        assert_eq!(board[2].1.incorrect, 1);
        assert!((state.user_stats[&1].accuracy() - 1.0).abs() < f64::EPSILON);

        let details = state.vote_details(5);
        assert_eq!(details.len(), 3);
        assert_eq!(details[2].is_correct, Some(false));

        let stats = state.message_stats(5).unwrap();
        assert_eq!(stats.total_votes, 3);
        assert_eq!(stats.distribution["up"], 2);
        assert!(stats.is_final);
    }

    #[test]
    fn bad_scores_leave_state_untouched() {
        let now = Utc::now();
        let mut state = VoteState::default();
        state.open_message(5, 99, now);
        state.cast(vk(5, 1), "up", 1.0, now, TimeDelta::minutes(2));
        let before = state.clone();

        let err = state
            .resolve(5, "up", true, now, |_, votes| {
                votes.keys().map(|k| (*k, f64::NAN)).collect()
            })
            .unwrap_err();
        assert!(matches!(err, Error::Operation(_)));
        assert_eq!(state, before);
    }

    #[test]
    fn cleanup_removes_old_messages_and_votes() {
        let now = Utc::now();
        let old = now - TimeDelta::days(40);
        let mut state = VoteState::default();
        state.open_message(1, 9, old);
        state.open_message(2, 9, now);
        state.cast(vk(1, 7), "up", 1.0, old, TimeDelta::minutes(2));
        state.cast(vk(2, 7), "up", 1.0, now, TimeDelta::minutes(2));

        assert_eq!(state.cleanup_before(now - TimeDelta::days(30)), 1);
        assert_eq!(state.votes().len(), 1);
        assert_eq!(state.user_votes[&7].len(), 1);
        assert_eq!(
            state,
            VoteState::from_primary(
                state.votes.clone(),
                state.messages.clone(),
                state.user_stats.clone()
            )
        );
    }

    #[tokio::test]
    async fn store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("votes.msgpack");
        let now = Utc::now();
        let store = VoteStore::new(StorageConfig::new(&path));
        store.initialize().await.unwrap();
        store.open_message(3, 1, now).await.unwrap();
        assert_eq!(
            store.cast(vk(3, 2), "up", 1.0, now, TimeDelta::minutes(2)).await.unwrap(),
            CastOutcome::Accepted
        );
        assert!(store.cast(vk(3, 4), "", 1.0, now, TimeDelta::minutes(2)).await.is_err());
        assert!(store.cast(vk(3, 4), "up", 0.0, now, TimeDelta::minutes(2)).await.is_err());
        assert!(store.close_message(3).await.unwrap());
        assert!(store.resolve(3, "up", true, now, flat_scorer).await.unwrap());
        store.close().await.unwrap();

        let store = VoteStore::new(StorageConfig::new(&path));
        store.initialize().await.unwrap();
        assert_eq!(store.user_stats(2).await.correct, 1);
        assert_eq!(store.vote_details(3).await.len(), 1);
        assert!(store.message_stats(3).await.unwrap().is_final);
        assert_eq!(store.leaderboard(1).await.len(), 1);
        assert_eq!(store.cleanup_before(now + TimeDelta::seconds(1)).await.unwrap(), 1);
        store.close().await.unwrap();
    }
}
