//! MessagePack document encoding shared by every store.
//!
//! Documents are written with named fields so that fields added later can be
//! defaulted when an older file is read.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, StorageError};

#[derive(serde::Deserialize)]
struct VersionHeader {
    version: u32,
}

/// Encode a store document as a self-describing MessagePack map.
pub fn encode_document<T: Serialize>(store: &'static str, document: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(document).map_err(|e| {
        StorageError::Encode {
            store,
            details: e.to_string(),
        }
        .into()
    })
}

/// Decode a store document, refusing schema versions newer than `supported`.
pub fn decode_document<T: DeserializeOwned>(
    store: &'static str,
    supported: u32,
    bytes: &[u8],
) -> Result<T> {
    let header: VersionHeader = rmp_serde::from_slice(bytes).map_err(|e| StorageError::Decode {
        store,
        details: e.to_string(),
    })?;
    if header.version > supported {
        return Err(StorageError::UnsupportedVersion {
            store,
            found: header.version,
            supported,
        }
        .into());
    }
    rmp_serde::from_slice(bytes).map_err(|e| {
        StorageError::Decode {
            store,
            details: e.to_string(),
        }
        .into()
    })
}
