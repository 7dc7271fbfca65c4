//! Applies decoded position events to the stores.
//!
//! Items look like:
//!
//! ```json
//! {"signature": "...", "events": [
//!   {"kind": "position_create", "owner": "...", "lb_pair": "...", "position": "...",
//!    "token_x": "...", "token_y": "..."},
//!   {"kind": "position_close", "owner": "...", "lb_pair": "..."}
//! ]}
//! ```
//!
//! Only activity of registered wallets is tracked; other items are skipped.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::Result;
use crate::error::ValidationError;
use crate::pipeline::TransactionHandler;
use crate::stores::{PositionKey, PositionStore, TokenPairStore, WalletStore};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PositionEvent {
    PositionCreate {
        owner: String,
        lb_pair: String,
        position: String,
        token_x: String,
        token_y: String,
    },
    PositionClose {
        owner: String,
        lb_pair: String,
    },
}

impl PositionEvent {
    #[must_use]
    pub fn owner(&self) -> &str {
        match self {
            Self::PositionCreate { owner, .. } | Self::PositionClose { owner, .. } => owner,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventItem {
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    events: Vec<PositionEvent>,
}

pub struct PositionEventHandler {
    positions: Arc<PositionStore>,
    wallets: Arc<WalletStore>,
    token_pairs: Arc<TokenPairStore>,
}

impl PositionEventHandler {
    #[must_use]
    pub fn new(
        positions: Arc<PositionStore>,
        wallets: Arc<WalletStore>,
        token_pairs: Arc<TokenPairStore>,
    ) -> Self {
        Self {
            positions,
            wallets,
            token_pairs,
        }
    }

    async fn apply(&self, event: PositionEvent) -> Result<()> {
        match event {
            PositionEvent::PositionCreate {
                owner,
                lb_pair,
                position,
                token_x,
                token_y,
            } => {
                let key = PositionKey::new(&token_x, &token_y, &owner, &lb_pair)?;
                self.token_pairs.set_tokens(&lb_pair, &token_x, &token_y).await?;
                self.positions.add(&key).await?;
                info!(%owner, %lb_pair, %position, "position opened");
            }
            PositionEvent::PositionClose { owner, lb_pair } => {
                let (pair, deleted) = self.positions.remove(&owner, &lb_pair).await?;
                if pair.is_none() {
                    debug!(%owner, %lb_pair, "close for untracked position");
                } else {
                    info!(%owner, %lb_pair, deleted, "position closed");
                }
            }
        }
        Ok(())
    }
}

impl TransactionHandler for PositionEventHandler {
    async fn process(&self, item: Value) -> Result<()> {
        let item: EventItem = serde_json::from_value(item)
            .map_err(|e| ValidationError::Payload(e.to_string()))?;
        let delivery_id = item.signature.as_deref().unwrap_or("-");

        let Some(first) = item.events.first() else {
            debug!(delivery_id, "item carries no events");
            return Ok(());
        };
        if !self.wallets.exists(first.owner()).await {
            debug!(delivery_id, owner = first.owner(), "skipping unregistered owner");
            return Ok(());
        }

        for event in item.events {
            self.apply(event).await?;
        }
        Ok(())
    }
}
