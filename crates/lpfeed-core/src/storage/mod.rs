//! Generic crash-safe persistence.
//!
//! - [`engine`]: lifecycle, locking, batching and atomic saves
//! - [`codec`]: versioned MessagePack documents
//! - [`key`]: composite key validation and flattening

pub mod codec;
pub mod engine;
pub mod key;

pub use codec::{decode_document, encode_document};
pub use engine::{Change, Lifecycle, StateContainer, StorageEngine, write_atomically};
pub use key::{KEY_DELIMITER, join_key, split_key};
