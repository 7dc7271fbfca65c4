//! Registered wallets.
//!
//! A user may register many wallets; a wallet belongs to at most one user.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{bucket_insert, bucket_remove};
use crate::storage::key::{join_key, require_component, split_key};
use crate::storage::{Change, StateContainer, StorageEngine, decode_document, encode_document};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalletKey {
    user_id: String,
    wallet: String,
}

impl WalletKey {
    pub fn new(user_id: impl Into<String>, wallet: impl Into<String>) -> Result<Self> {
        let key = Self {
            user_id: user_id.into(),
            wallet: wallet.into(),
        };
        require_component("user_id", &key.user_id)?;
        require_component("wallet", &key.wallet)?;
        Ok(key)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn wallet(&self) -> &str {
        &self.wallet
    }

    #[must_use]
    pub fn to_key_string(&self) -> String {
        join_key(&[&self.user_id, &self.wallet])
    }

    pub fn from_key_string(input: &str) -> Result<Self> {
        let [user_id, wallet] = split_key::<2>("wallet", input)?;
        Self::new(user_id, wallet)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletState {
    // value: is_anonymous
    wallets: BTreeMap<WalletKey, bool>,
    user_wallets: BTreeMap<String, BTreeSet<String>>,
    wallet_owner: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct WalletDocument {
    version: u32,
    #[serde(default)]
    wallets: BTreeMap<String, bool>,
}

impl WalletState {
    /// Rebuild indices. Fails if two users claim the same wallet.
    pub fn from_primary(wallets: BTreeMap<WalletKey, bool>) -> Result<Self> {
        let mut state = Self::default();
        for key in wallets.keys() {
            state.check_owner(key)?;
            state.index(key);
        }
        state.wallets = wallets;
        Ok(state)
    }

    pub fn primary(&self) -> &BTreeMap<WalletKey, bool> {
        &self.wallets
    }

    fn index(&mut self, key: &WalletKey) {
        bucket_insert(&mut self.user_wallets, key.user_id.clone(), key.wallet.clone());
        self.wallet_owner
            .insert(key.wallet.clone(), key.user_id.clone());
    }

    fn check_owner(&self, key: &WalletKey) -> Result<()> {
        match self.wallet_owner.get(&key.wallet) {
            Some(owner) if *owner != key.user_id => Err(Error::operation(format!(
                "wallet {} is already registered to another user",
                key.wallet
            ))),
            _ => Ok(()),
        }
    }

    /// Register a wallet. Returns false if this user already has it.
    pub fn add(&mut self, key: &WalletKey, anonymous: bool) -> Result<bool> {
        self.check_owner(key)?;
        if self.wallets.contains_key(key) {
            return Ok(false);
        }
        self.wallets.insert(key.clone(), anonymous);
        self.index(key);
        Ok(true)
    }

    pub fn remove(&mut self, key: &WalletKey) -> bool {
        if self.wallets.remove(key).is_none() {
            return false;
        }
        bucket_remove(&mut self.user_wallets, &key.user_id, &key.wallet);
        self.wallet_owner.remove(&key.wallet);
        true
    }

    #[must_use]
    pub fn owner_of(&self, wallet: &str) -> Option<&str> {
        self.wallet_owner.get(wallet).map(String::as_str)
    }

    #[must_use]
    pub fn is_anonymous(&self, wallet: &str) -> bool {
        self.wallet_owner
            .get(wallet)
            .and_then(|user| {
                self.wallets.get(&WalletKey {
                    user_id: user.clone(),
                    wallet: wallet.to_string(),
                })
            })
            .copied()
            .unwrap_or(false)
    }
}

impl StateContainer for WalletState {
    const STORE: &'static str = "wallets";
    const VERSION: u32 = 1;

    fn serialize(&self) -> Result<Vec<u8>> {
        let doc = WalletDocument {
            version: Self::VERSION,
            wallets: self
                .wallets
                .iter()
                .map(|(k, anon)| (k.to_key_string(), *anon))
                .collect(),
        };
        encode_document(Self::STORE, &doc)
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let doc: WalletDocument = decode_document(Self::STORE, Self::VERSION, bytes)?;
        let wallets = doc
            .wallets
            .into_iter()
            .map(|(k, anon)| Ok((WalletKey::from_key_string(&k)?, anon)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Self::from_primary(wallets)
    }

    fn record_count(&self) -> usize {
        self.wallets.len()
    }
}

pub struct WalletStore {
    engine: StorageEngine<WalletState>,
}

store_lifecycle!(WalletStore, WalletState);

impl WalletStore {
    pub async fn add(&self, key: &WalletKey, anonymous: bool) -> Result<bool> {
        self.engine
            .write(|s| {
                Ok(if s.add(key, anonymous)? {
                    Change::Modified(true)
                } else {
                    Change::Unchanged(false)
                })
            })
            .await
    }

    pub async fn remove(&self, key: &WalletKey) -> Result<bool> {
        self.engine
            .write(|s| {
                Ok(if s.remove(key) {
                    Change::Modified(true)
                } else {
                    Change::Unchanged(false)
                })
            })
            .await
    }

    pub async fn user_wallets(&self, user_id: &str) -> BTreeSet<String> {
        self.engine
            .read(|s| s.user_wallets.get(user_id).cloned().unwrap_or_default())
            .await
    }

    pub async fn owner_of(&self, wallet: &str) -> Option<String> {
        self.engine
            .read(|s| s.owner_of(wallet).map(str::to_string))
            .await
    }

    pub async fn exists(&self, wallet: &str) -> bool {
        self.engine
            .read(|s| s.wallet_owner.contains_key(wallet))
            .await
    }

    pub async fn all_wallets(&self) -> BTreeSet<String> {
        self.engine
            .read(|s| s.wallet_owner.keys().cloned().collect())
            .await
    }

    pub async fn is_anonymous(&self, wallet: &str) -> bool {
        self.engine.read(|s| s.is_anonymous(wallet)).await
    }
}
