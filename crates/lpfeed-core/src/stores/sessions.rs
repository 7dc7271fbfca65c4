//! Per-(pair, owner) tracking sessions.
//!
//! A session follows one owner's open positions in one pair and the chat
//! thread reporting on them. When the open count drops to zero the session
//! is stamped closed; [`SessionStore::remove_expired`] later reaps it.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{bucket_insert, bucket_remove};
use crate::Result;
use crate::storage::key::{join_key, require_component, split_key};
use crate::storage::{Change, StateContainer, StorageEngine, decode_document, encode_document};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey {
    lb_pair: String,
    owner: String,
}

impl SessionKey {
    pub fn new(lb_pair: impl Into<String>, owner: impl Into<String>) -> Result<Self> {
        let key = Self {
            lb_pair: lb_pair.into(),
            owner: owner.into(),
        };
        require_component("lb_pair", &key.lb_pair)?;
        require_component("owner", &key.owner)?;
        Ok(key)
    }

    pub fn lb_pair(&self) -> &str {
        &self.lb_pair
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn to_key_string(&self) -> String {
        join_key(&[&self.lb_pair, &self.owner])
    }

    pub fn from_key_string(input: &str) -> Result<Self> {
        let [lb_pair, owner] = split_key::<2>("session", input)?;
        Self::new(lb_pair, owner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub thread_id: u64,
    #[serde(default = "one")]
    pub open_positions: u32,
    #[serde(default)]
    pub last_closed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub main_message_id: Option<u64>,
    #[serde(default)]
    pub placeholder_message_id: Option<u64>,
}

fn one() -> u32 {
    1
}

impl SessionRecord {
    #[must_use]
    pub fn new(thread_id: u64) -> Self {
        Self {
            thread_id,
            open_positions: 1,
            last_closed: None,
            main_message_id: None,
            placeholder_message_id: None,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, timeout: TimeDelta) -> bool {
        self.open_positions == 0 && self.last_closed.is_some_and(|closed| now - closed > timeout)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    sessions: BTreeMap<SessionKey, SessionRecord>,
    by_pair: BTreeMap<String, BTreeSet<SessionKey>>,
    by_owner: BTreeMap<String, BTreeSet<SessionKey>>,
}

#[derive(Serialize, Deserialize)]
struct SessionDocument {
    version: u32,
    #[serde(default)]
    sessions: BTreeMap<String, SessionRecord>,
}

impl SessionState {
    #[must_use]
    pub fn from_primary(sessions: BTreeMap<SessionKey, SessionRecord>) -> Self {
        let mut state = Self::default();
        for key in sessions.keys() {
            state.index(key);
        }
        state.sessions = sessions;
        state
    }

    pub fn primary(&self) -> &BTreeMap<SessionKey, SessionRecord> {
        &self.sessions
    }

    fn index(&mut self, key: &SessionKey) {
        bucket_insert(&mut self.by_pair, key.lb_pair.clone(), key.clone());
        bucket_insert(&mut self.by_owner, key.owner.clone(), key.clone());
    }

    fn unindex(&mut self, key: &SessionKey) {
        bucket_remove(&mut self.by_pair, &key.lb_pair, key);
        bucket_remove(&mut self.by_owner, &key.owner, key);
    }

    /// Insert or replace a session. Returns true when the key is new.
    pub fn create(&mut self, key: SessionKey, record: SessionRecord) -> bool {
        let is_new = !self.sessions.contains_key(&key);
        if is_new {
            self.index(&key);
        }
        self.sessions.insert(key, record);
        is_new
    }

    pub fn remove_expired(
        &mut self,
        now: DateTime<Utc>,
        timeout: TimeDelta,
    ) -> Vec<(SessionKey, SessionRecord)> {
        let expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, record)| record.is_expired(now, timeout))
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for key in expired {
            self.unindex(&key);
            if let Some(record) = self.sessions.remove(&key) {
                removed.push((key, record));
            }
        }
        removed
    }

    fn collect(&self, keys: Option<&BTreeSet<SessionKey>>) -> Vec<(SessionKey, SessionRecord)> {
        keys.into_iter()
            .flatten()
            .filter_map(|k| self.sessions.get(k).map(|r| (k.clone(), r.clone())))
            .collect()
    }
}

impl StateContainer for SessionState {
    const STORE: &'static str = "sessions";
    const VERSION: u32 = 1;

    fn serialize(&self) -> Result<Vec<u8>> {
        let doc = SessionDocument {
            version: Self::VERSION,
            sessions: self
                .sessions
                .iter()
                .map(|(k, r)| (k.to_key_string(), r.clone()))
                .collect(),
        };
        encode_document(Self::STORE, &doc)
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let doc: SessionDocument = decode_document(Self::STORE, Self::VERSION, bytes)?;
        let sessions = doc
            .sessions
            .into_iter()
            .map(|(k, r)| Ok((SessionKey::from_key_string(&k)?, r)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self::from_primary(sessions))
    }

    fn record_count(&self) -> usize {
        self.sessions.len()
    }
}

pub struct SessionStore {
    engine: StorageEngine<SessionState>,
}

store_lifecycle!(SessionStore, SessionState);

impl SessionStore {
    /// Start tracking a session with one open position.
    pub async fn create(
        &self,
        key: &SessionKey,
        thread_id: u64,
        main_message_id: Option<u64>,
        placeholder_message_id: Option<u64>,
    ) -> Result<bool> {
        let record = SessionRecord {
            main_message_id,
            placeholder_message_id,
            ..SessionRecord::new(thread_id)
        };
        let key = key.clone();
        self.engine
            .write(move |s| Ok(Change::Modified(s.create(key, record))))
            .await
    }

    pub async fn get(&self, key: &SessionKey) -> Option<SessionRecord> {
        self.engine.read(|s| s.sessions.get(key).cloned()).await
    }

    pub async fn open_position(&self, key: &SessionKey) -> Result<bool> {
        self.engine
            .write(|s| {
                let Some(record) = s.sessions.get_mut(key) else {
                    warn!(store = "sessions", key = %key.to_key_string(), "No session to open a position in");
                    return Ok(Change::Unchanged(false));
                };
                record.open_positions = record.open_positions.saturating_add(1);
                Ok(Change::Modified(true))
            })
            .await
    }

    /// Decrement the open count, stamping `last_closed` when it reaches zero.
    pub async fn close_position(&self, key: &SessionKey, now: DateTime<Utc>) -> Result<bool> {
        self.engine
            .write(|s| {
                let Some(record) = s.sessions.get_mut(key) else {
                    warn!(store = "sessions", key = %key.to_key_string(), "No session to close a position in");
                    return Ok(Change::Unchanged(false));
                };
                if record.open_positions == 0 {
                    warn!(store = "sessions", key = %key.to_key_string(), "Session has no open positions");
                    return Ok(Change::Unchanged(false));
                }
                record.open_positions -= 1;
                if record.open_positions == 0 {
                    record.last_closed = Some(now);
                }
                Ok(Change::Modified(true))
            })
            .await
    }

    pub async fn set_message_ids(
        &self,
        key: &SessionKey,
        main_message_id: u64,
        placeholder_message_id: u64,
    ) -> Result<bool> {
        self.engine
            .write(|s| {
                let Some(record) = s.sessions.get_mut(key) else {
                    warn!(store = "sessions", key = %key.to_key_string(), "No session to attach messages to");
                    return Ok(Change::Unchanged(false));
                };
                record.main_message_id = Some(main_message_id);
                record.placeholder_message_id = Some(placeholder_message_id);
                Ok(Change::Modified(true))
            })
            .await
    }

    pub async fn sessions_for_pair(&self, lb_pair: &str) -> Vec<(SessionKey, SessionRecord)> {
        self.engine.read(|s| s.collect(s.by_pair.get(lb_pair))).await
    }

    pub async fn sessions_for_owner(&self, owner: &str) -> Vec<(SessionKey, SessionRecord)> {
        self.engine.read(|s| s.collect(s.by_owner.get(owner))).await
    }

    /// Remove sessions idle for longer than `timeout` and hand them back so
    /// the caller can tear down their threads.
    pub async fn remove_expired(
        &self,
        now: DateTime<Utc>,
        timeout: TimeDelta,
    ) -> Result<Vec<(SessionKey, SessionRecord)>> {
        let removed = self
            .engine
            .write(|s| {
                let removed = s.remove_expired(now, timeout);
                Ok(if removed.is_empty() {
                    Change::Unchanged(removed)
                } else {
                    Change::Modified(removed)
                })
            })
            .await?;
        if !removed.is_empty() {
            debug!(store = "sessions", count = removed.len(), "Reaped expired sessions");
        }
        Ok(removed)
    }
}
