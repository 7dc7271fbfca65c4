//! Pool to token-pair mapping, with a reverse token index.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{bucket_insert, bucket_remove};
use crate::Result;
use crate::storage::key::require_component;
use crate::storage::{Change, StateContainer, StorageEngine, decode_document, encode_document};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenPair {
    pub token_x: String,
    pub token_y: String,
}

impl TokenPair {
    pub fn new(token_x: impl Into<String>, token_y: impl Into<String>) -> Result<Self> {
        let pair = Self {
            token_x: token_x.into(),
            token_y: token_y.into(),
        };
        require_component("token_x", &pair.token_x)?;
        require_component("token_y", &pair.token_y)?;
        Ok(pair)
    }

    fn tokens(&self) -> [&str; 2] {
        [&self.token_x, &self.token_y]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenPairState {
    pairs: BTreeMap<String, TokenPair>,
    token_pairs: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Serialize, Deserialize)]
struct TokenPairDocument {
    version: u32,
    #[serde(default)]
    pairs: BTreeMap<String, TokenPair>,
}

impl TokenPairState {
    #[must_use]
    pub fn from_primary(pairs: BTreeMap<String, TokenPair>) -> Self {
        let mut token_pairs = BTreeMap::new();
        for (lb_pair, pair) in &pairs {
            for token in pair.tokens() {
                bucket_insert(&mut token_pairs, token.to_string(), lb_pair.clone());
            }
        }
        Self { pairs, token_pairs }
    }

    pub fn primary(&self) -> &BTreeMap<String, TokenPair> {
        &self.pairs
    }

    fn unindex(&mut self, lb_pair: &str, pair: &TokenPair) {
        for token in pair.tokens() {
            bucket_remove(&mut self.token_pairs, &token.to_string(), &lb_pair.to_string());
        }
    }

    /// Record the tokens of a pool, replacing any previous pair.
    /// Returns false when the pair was already recorded as given.
    pub fn set_tokens(&mut self, lb_pair: &str, pair: TokenPair) -> bool {
        if self.pairs.get(lb_pair) == Some(&pair) {
            return false;
        }
        if let Some(old) = self.pairs.remove(lb_pair) {
            self.unindex(lb_pair, &old);
        }
        for token in pair.tokens() {
            bucket_insert(&mut self.token_pairs, token.to_string(), lb_pair.to_string());
        }
        self.pairs.insert(lb_pair.to_string(), pair);
        true
    }

    pub fn remove_pair(&mut self, lb_pair: &str) -> bool {
        match self.pairs.remove(lb_pair) {
            Some(old) => {
                self.unindex(lb_pair, &old);
                true
            }
            None => false,
        }
    }
}

impl StateContainer for TokenPairState {
    const STORE: &'static str = "token_pairs";
    const VERSION: u32 = 1;

    fn serialize(&self) -> Result<Vec<u8>> {
        encode_document(
            Self::STORE,
            &TokenPairDocument {
                version: Self::VERSION,
                pairs: self.pairs.clone(),
            },
        )
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let doc: TokenPairDocument = decode_document(Self::STORE, Self::VERSION, bytes)?;
        for (lb_pair, pair) in &doc.pairs {
            require_component("lb_pair", lb_pair)?;
            TokenPair::new(pair.token_x.as_str(), pair.token_y.as_str())?;
        }
        Ok(Self::from_primary(doc.pairs))
    }

    fn record_count(&self) -> usize {
        self.pairs.len()
    }
}

pub struct TokenPairStore {
    engine: StorageEngine<TokenPairState>,
}

store_lifecycle!(TokenPairStore, TokenPairState);

impl TokenPairStore {
    pub async fn set_tokens(&self, lb_pair: &str, token_x: &str, token_y: &str) -> Result<bool> {
        require_component("lb_pair", lb_pair)?;
        let pair = TokenPair::new(token_x, token_y)?;
        self.engine
            .write(|s| {
                Ok(if s.set_tokens(lb_pair, pair) {
                    Change::Modified(true)
                } else {
                    Change::Unchanged(false)
                })
            })
            .await
    }

    pub async fn tokens(&self, lb_pair: &str) -> Option<TokenPair> {
        self.engine.read(|s| s.pairs.get(lb_pair).cloned()).await
    }

    pub async fn pairs_by_token(&self, token: &str) -> BTreeSet<String> {
        self.engine
            .read(|s| s.token_pairs.get(token).cloned().unwrap_or_default())
            .await
    }

    pub async fn remove_pair(&self, lb_pair: &str) -> Result<bool> {
        require_component("lb_pair", lb_pair)?;
        self.engine
            .write(|s| {
                Ok(if s.remove_pair(lb_pair) {
                    Change::Modified(true)
                } else {
                    Change::Unchanged(false)
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn pair(x: &str, y: &str) -> TokenPair {
        TokenPair::new(x, y).unwrap()
    }

    #[test]
    fn replacing_tokens_reindexes_and_prunes() {
        let mut state = TokenPairState::default();
        assert!(state.set_tokens("P", pair("A", "B")));
        assert!(state.set_tokens("Q", pair("A", "C")));
        assert!(!state.set_tokens("Q", pair("A", "C")));
        assert!(state.set_tokens("P", pair("A", "D")));

        assert!(!state.token_pairs.contains_key("B"));
        assert_eq!(
            state.token_pairs["A"],
            BTreeSet::from(["P".to_string(), "Q".to_string()])
        );
        assert_eq!(state, TokenPairState::from_primary(state.primary().clone()));

        assert!(state.remove_pair("P"));
        assert!(state.remove_pair("Q"));
        assert_eq!(state, TokenPairState::default());
    }

    #[tokio::test]
    async fn store_queries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token_pairs.msgpack");
        let store = TokenPairStore::new(StorageConfig::new(&path));
        store.initialize().await.unwrap();
        assert!(store.set_tokens("P", "SOL", "USDC").await.unwrap());
        assert!(store.set_tokens("", "SOL", "USDC").await.is_err());
        store.close().await.unwrap();

        let store = TokenPairStore::new(StorageConfig::new(&path));
        store.initialize().await.unwrap();
        assert_eq!(store.tokens("P").await, Some(pair("SOL", "USDC")));
        assert_eq!(store.pairs_by_token("USDC").await, BTreeSet::from(["P".to_string()]));
        assert!(!store.remove_pair("nope").await.unwrap());
        assert!(store.remove_pair("P").await.unwrap());
        assert!(store.pairs_by_token("SOL").await.is_empty());
        store.close().await.unwrap();
    }
}
