//! Generic persistent storage engine.
//!
//! A [`StorageEngine`] owns exactly one [`StateContainer`] and persists it to a
//! single file. Every mutation runs as a synchronous closure under the write
//! lock, so a multi-index update is never observed half-applied. Persistence is
//! write-temp-then-rename: the destination always holds a complete document.
//!
//! Saves are triggered three ways:
//! - the periodic task, every `save_interval`
//! - a batch save, spawned when `batch_size` mutations accumulate
//! - the final save in [`StorageEngine::close`]

use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::retry::{RetryPolicy, TokioSleeper, with_retry, with_retry_outcome};

/// Prefix of staging files written next to (or in `temp_dir` for) a store.
pub const TEMP_PREFIX: &str = "storage_";
/// Suffix of staging files.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Extra pause after a failed periodic save before the next tick.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A versioned aggregate with a primary mapping and derived indices.
///
/// Implementations rebuild every derived index from primary data in
/// `deserialize`; indices are never written to disk.
pub trait StateContainer: Default + Send + Sync + 'static {
    /// Store name used in logs, errors and file names.
    const STORE: &'static str;
    /// Current schema version.
    const VERSION: u32;

    fn serialize(&self) -> Result<Vec<u8>>;

    fn deserialize(bytes: &[u8]) -> Result<Self>;

    /// Number of primary records, for logs and status output.
    fn record_count(&self) -> usize;
}

/// Result of a mutation closure: the value to return, and whether state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change<R> {
    Modified(R),
    Unchanged(R),
}

impl<R> Change<R> {
    fn into_parts(self) -> (R, bool) {
        match self {
            Self::Modified(value) => (value, true),
            Self::Unchanged(value) => (value, false),
        }
    }
}

/// Engine lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Uninitialized,
    Running,
    Closed,
}

struct Guarded<S> {
    container: S,
    lifecycle: Lifecycle,
    dirty: bool,
    changes_since_save: u64,
    // Monotonic count of applied modifications.
    generation: u64,
    batch_save_pending: bool,
}

#[derive(Default)]
struct Background {
    shutdown: Option<watch::Sender<bool>>,
    periodic: Option<JoinHandle<()>>,
    pending_saves: JoinSet<()>,
}

struct Shared<S> {
    config: StorageConfig,
    state: RwLock<Guarded<S>>,
    // Serializes save() calls so snapshots reach disk in generation order.
    save_lock: tokio::sync::Mutex<()>,
    // Generation of the document currently on disk. Checked inside the
    // blocking writer so an aborted save can never rename an older snapshot
    // over a newer one.
    written_generation: Arc<Mutex<u64>>,
    background: Mutex<Background>,
}

/// Persistent, crash-safe home of one state container.
pub struct StorageEngine<S: StateContainer> {
    shared: Arc<Shared<S>>,
}

impl<S: StateContainer> StorageEngine<S> {
    #[must_use]
    pub fn new(config: StorageConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: RwLock::new(Guarded {
                    container: S::default(),
                    lifecycle: Lifecycle::Uninitialized,
                    dirty: false,
                    changes_since_save: 0,
                    generation: 0,
                    batch_save_pending: false,
                }),
                save_lock: tokio::sync::Mutex::new(()),
                written_generation: Arc::new(Mutex::new(0)),
                background: Mutex::new(Background::default()),
            }),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    /// Load the store file (or start empty) and start the periodic save task.
    ///
    /// A missing file or an undecodable one yields an empty container. A file
    /// written by a newer schema is copied to `<file>.v<version>.bak` first,
    /// then treated the same way.
    pub async fn initialize(&self) -> Result<()> {
        let mut guard = self.shared.state.write().await;
        match guard.lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Closed => return Err(StorageError::Closed { store: S::STORE }.into()),
            Lifecycle::Uninitialized => {}
        }

        guard.container = self.shared.load().await?;
        guard.lifecycle = Lifecycle::Running;
        guard.dirty = false;
        guard.changes_since_save = 0;
        drop(guard);

        self.spawn_periodic();
        Ok(())
    }

    /// Apply a mutation under the write lock.
    ///
    /// The closure must validate before touching state and must not leave
    /// partial changes behind when it returns an error.
    pub async fn write<R>(&self, mutate: impl FnOnce(&mut S) -> Result<Change<R>>) -> Result<R> {
        let mut guard = self.shared.state.write().await;
        match guard.lifecycle {
            Lifecycle::Running => {}
            Lifecycle::Uninitialized => {
                return Err(StorageError::NotInitialized { store: S::STORE }.into());
            }
            Lifecycle::Closed => return Err(StorageError::Closed { store: S::STORE }.into()),
        }

        let (value, modified) = mutate(&mut guard.container)?.into_parts();
        if modified {
            guard.dirty = true;
            guard.changes_since_save += 1;
            guard.generation += 1;
            if guard.changes_since_save >= self.shared.config.batch_size()
                && !guard.batch_save_pending
            {
                guard.batch_save_pending = true;
                self.spawn_batch_save();
            }
        }
        Ok(value)
    }

    /// Run a read-only closure under the shared lock.
    pub async fn read<R>(&self, inspect: impl FnOnce(&S) -> R) -> R {
        let guard = self.shared.state.read().await;
        inspect(&guard.container)
    }

    /// Save now if dirty. Returns whether a file was written.
    pub async fn flush(&self) -> Result<bool> {
        self.shared.save().await
    }

    pub async fn is_dirty(&self) -> bool {
        self.shared.state.read().await.dirty
    }

    /// Mutations applied since the last successful save.
    pub async fn pending_changes(&self) -> u64 {
        self.shared.state.read().await.changes_since_save
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.shared.state.read().await.lifecycle
    }

    /// Stop background work and perform a final save. Idempotent.
    ///
    /// The periodic task and in-flight saves each get up to `save_interval` to
    /// finish, so shutdown can take about twice that before stragglers are
    /// aborted.
    pub async fn close(&self) -> Result<()> {
        {
            let mut guard = self.shared.state.write().await;
            let previous = guard.lifecycle;
            guard.lifecycle = Lifecycle::Closed;
            match previous {
                Lifecycle::Running => {}
                Lifecycle::Uninitialized | Lifecycle::Closed => return Ok(()),
            }
        }

        let (shutdown, periodic, mut pending) = {
            let mut bg = self
                .shared
                .background
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            (
                bg.shutdown.take(),
                bg.periodic.take(),
                std::mem::take(&mut bg.pending_saves),
            )
        };

        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }

        let grace = self.shared.config.save_interval();
        if let Some(handle) = periodic {
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!(store = S::STORE, "Periodic save task did not stop in time; aborting");
                abort.abort();
            }
        }

        let drained = tokio::time::timeout(grace, async {
            while pending.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                store = S::STORE,
                stragglers = pending.len(),
                "Aborting in-flight saves after close timeout"
            );
            pending.abort_all();
            while pending.join_next().await.is_some() {}
        }

        self.shared.save().await?;
        info!(store = S::STORE, path = %self.shared.config.file_path().display(), "Store closed");
        Ok(())
    }

    fn spawn_periodic(&self) {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_periodic(Arc::clone(&self.shared), rx));
        let mut bg = self
            .shared
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        bg.shutdown = Some(tx);
        bg.periodic = Some(handle);
    }

    fn spawn_batch_save(&self) {
        let shared = Arc::clone(&self.shared);
        let mut bg = self
            .shared
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        while bg.pending_saves.try_join_next().is_some() {}
        bg.pending_saves.spawn(async move {
            debug!(store = S::STORE, "Batch size reached; saving out of band");
            if let Err(err) = shared.save().await {
                error!(store = S::STORE, error = %err, "Batch save failed");
            }
            shared.state.write().await.batch_save_pending = false;
        });
    }
}

impl<S: StateContainer> Drop for StorageEngine<S> {
    fn drop(&mut self) {
        let mut bg = self
            .shared
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = bg.shutdown.take() {
            warn!(store = S::STORE, "Storage engine dropped without close(); unsaved changes may be lost");
            let _ = tx.send(true);
        }
    }
}

impl<S: StateContainer> Shared<S> {
    async fn load(&self) -> Result<S> {
        let path = self.config.file_path().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StorageError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let policy = RetryPolicy::store_load(&self.config);
        let read = with_retry(
            &policy,
            &TokioSleeper,
            |e: &io::Error| e.kind() != io::ErrorKind::NotFound,
            || tokio::fs::read(&path),
        )
        .await;

        let bytes = match read {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(store = S::STORE, path = %path.display(), "No store file yet; starting empty");
                return Ok(S::default());
            }
            Err(source) => return Err(StorageError::Io { path, source }.into()),
        };

        match S::deserialize(&bytes) {
            Ok(container) => {
                info!(
                    store = S::STORE,
                    path = %path.display(),
                    records = container.record_count(),
                    "Loaded store"
                );
                Ok(container)
            }
            Err(err @ crate::Error::Storage(StorageError::UnsupportedVersion { found, .. })) => {
                let backup = newer_schema_backup(&path, found);
                match tokio::fs::copy(&path, &backup).await {
                    Ok(_) => warn!(
                        store = S::STORE,
                        path = %path.display(),
                        backup = %backup.display(),
                        error = %err,
                        "Store file has a newer schema; backed it up and starting empty"
                    ),
                    Err(copy_err) => error!(
                        store = S::STORE,
                        path = %path.display(),
                        error = %err,
                        backup_error = %copy_err,
                        "Store file has a newer schema and could not be backed up; starting empty"
                    ),
                }
                Ok(S::default())
            }
            Err(err) => {
                warn!(
                    store = S::STORE,
                    path = %path.display(),
                    error = %err,
                    "Store file could not be decoded; starting empty"
                );
                Ok(S::default())
            }
        }
    }

    async fn save(&self) -> Result<bool> {
        let _serialized = self.save_lock.lock().await;

        let (bytes, generation, saved_changes) = {
            let guard = self.state.read().await;
            if !guard.dirty {
                return Ok(false);
            }
            (
                guard.container.serialize()?,
                guard.generation,
                guard.changes_since_save,
            )
        };

        self.persist(bytes, generation).await?;

        let mut guard = self.state.write().await;
        guard.changes_since_save = guard.changes_since_save.saturating_sub(saved_changes);
        if guard.generation == generation {
            guard.dirty = false;
        }
        debug!(
            store = S::STORE,
            generation,
            still_dirty = guard.dirty,
            "Store saved"
        );
        Ok(true)
    }

    async fn persist(&self, bytes: Vec<u8>, generation: u64) -> Result<()> {
        let bytes: Arc<[u8]> = bytes.into();
        let dest = self.config.file_path().to_path_buf();
        let staging = self.config.staging_dir();
        let policy = RetryPolicy::store_save(&self.config);

        let outcome = with_retry_outcome(&policy, &TokioSleeper, |_: &io::Error| true, || {
            let bytes = Arc::clone(&bytes);
            let dest = dest.clone();
            let staging = staging.clone();
            let written = Arc::clone(&self.written_generation);
            async move {
                tokio::task::spawn_blocking(move || -> io::Result<()> {
                    let mut on_disk = written.lock().unwrap_or_else(|e| e.into_inner());
                    if *on_disk > generation {
                        return Ok(());
                    }
                    write_atomically(&dest, &staging, &bytes)?;
                    *on_disk = generation;
                    Ok(())
                })
                .await
                .map_err(io::Error::other)?
            }
        })
        .await;

        outcome.result.map_err(|e| {
            StorageError::SaveExhausted {
                path: dest,
                attempts: outcome.attempts,
                last_error: e.to_string(),
            }
            .into()
        })
    }
}

async fn run_periodic<S: StateContainer>(
    shared: Arc<Shared<S>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = shared.config.save_interval();
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }

        if let Err(err) = shared.save().await {
            error!(store = S::STORE, error = %err, "Periodic save failed");
            tokio::select! {
                () = tokio::time::sleep(ERROR_BACKOFF) => {}
                _ = shutdown.changed() => break,
            }
        }
    }
    debug!(store = S::STORE, "Periodic save loop stopped");
}

/// Side file that keeps a newer-schema store file from being lost on the next
/// save.
fn newer_schema_backup(path: &Path, version: u32) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".v{version}.bak"));
    path.with_file_name(name)
}

/// Write `bytes` to a fresh temp file in `staging`, fsync it, and rename it
/// over `dest`. The temp file is removed on every error path.
pub fn write_atomically(dest: &Path, staging: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(staging)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    sync_parent_dir(dest);
    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(dest: &Path) {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    if let Ok(dir) = std::fs::File::open(parent) {
        let _ = dir.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_dest: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ValidationError};
    use crate::storage::codec::{decode_document, encode_document};
    use std::collections::BTreeMap;

    /// Minimal container: a counter map plus a derived count index.
    #[derive(Debug, Default, PartialEq)]
    struct Counters {
        counts: BTreeMap<String, u64>,
        by_total: BTreeMap<u64, usize>,
    }

    #[derive(Serialize, serde::Deserialize)]
    struct CountersDoc {
        version: u32,
        #[serde(default)]
        counts: BTreeMap<String, u64>,
    }

    impl Counters {
        fn bump(&mut self, name: &str) {
            let count = self.counts.entry(name.to_string()).or_insert(0);
            *count += 1;
            self.rebuild();
        }

        fn rebuild(&mut self) {
            self.by_total.clear();
            for count in self.counts.values() {
                *self.by_total.entry(*count).or_insert(0) += 1;
            }
        }
    }

    impl StateContainer for Counters {
        const STORE: &'static str = "counters";
        const VERSION: u32 = 1;

        fn serialize(&self) -> Result<Vec<u8>> {
            encode_document(
                Self::STORE,
                &CountersDoc {
                    version: Self::VERSION,
                    counts: self.counts.clone(),
                },
            )
        }

        fn deserialize(bytes: &[u8]) -> Result<Self> {
            let doc: CountersDoc = decode_document(Self::STORE, Self::VERSION, bytes)?;
            let mut state = Self {
                counts: doc.counts,
                by_total: BTreeMap::new(),
            };
            state.rebuild();
            Ok(state)
        }

        fn record_count(&self) -> usize {
            self.counts.len()
        }
    }

    fn config_for(path: &Path) -> StorageConfig {
        StorageConfig::builder(path)
            .save_interval(Duration::from_secs(3600))
            .save_retry_delay(Duration::from_millis(1))
            .build()
            .unwrap()
    }

    async fn bump(engine: &StorageEngine<Counters>, name: &str) -> Result<()> {
        engine
            .write(|s| {
                s.bump(name);
                Ok(Change::Modified(()))
            })
            .await
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::<Counters>::new(config_for(&dir.path().join("nested/c.msgpack")));
        engine.initialize().await.unwrap();

        assert_eq!(engine.read(|s| s.counts.len()).await, 0);
        assert!(dir.path().join("nested").is_dir());
        assert_eq!(engine.lifecycle().await, Lifecycle::Running);
        engine.close().await.unwrap();
        // nothing was dirty, so nothing was written
        assert!(!dir.path().join("nested/c.msgpack").exists());
    }

    #[tokio::test]
    async fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.msgpack");

        let engine = StorageEngine::<Counters>::new(config_for(&path));
        engine.initialize().await.unwrap();
        bump(&engine, "a").await.unwrap();
        bump(&engine, "a").await.unwrap();
        bump(&engine, "b").await.unwrap();
        assert!(engine.is_dirty().await);
        assert_eq!(engine.pending_changes().await, 3);
        engine.close().await.unwrap();

        let reopened = StorageEngine::<Counters>::new(config_for(&path));
        reopened.initialize().await.unwrap();
        let state = reopened
            .read(|s| (s.counts.clone(), s.by_total.clone()))
            .await;
        assert_eq!(state.0.get("a"), Some(&2));
        assert_eq!(state.0.get("b"), Some(&1));
        assert_eq!(state.1, BTreeMap::from([(1, 1), (2, 1)]));
        assert!(!reopened.is_dirty().await);
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn flush_is_noop_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::<Counters>::new(config_for(&dir.path().join("c.msgpack")));
        engine.initialize().await.unwrap();
        assert!(!engine.flush().await.unwrap());
        bump(&engine, "x").await.unwrap();
        assert!(engine.flush().await.unwrap());
        assert!(!engine.is_dirty().await);
        assert_eq!(engine.pending_changes().await, 0);
        assert!(!engine.flush().await.unwrap());
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn unchanged_mutation_does_not_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::<Counters>::new(config_for(&dir.path().join("c.msgpack")));
        engine.initialize().await.unwrap();
        let n = engine
            .write(|s| Ok(Change::Unchanged(s.counts.len())))
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert!(!engine.is_dirty().await);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_mutation_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::<Counters>::new(config_for(&dir.path().join("c.msgpack")));
        engine.initialize().await.unwrap();
        let err = engine
            .write::<()>(|_| Err(ValidationError::EmptyField { field: "name" }.into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!engine.is_dirty().await);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn writes_rejected_outside_running() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::<Counters>::new(config_for(&dir.path().join("c.msgpack")));
        let err = bump(&engine, "a").await.unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::NotInitialized { .. })));

        engine.initialize().await.unwrap();
        engine.close().await.unwrap();
        let err = bump(&engine, "a").await.unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::Closed { .. })));

        // close is idempotent, re-initialize is refused
        engine.close().await.unwrap();
        assert!(engine.initialize().await.is_err());
    }

    #[tokio::test]
    async fn batch_size_triggers_out_of_band_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.msgpack");
        let config = StorageConfig::builder(&path)
            .save_interval(Duration::from_secs(3600))
            .batch_size(3)
            .build()
            .unwrap();
        let engine = StorageEngine::<Counters>::new(config);
        engine.initialize().await.unwrap();

        for name in ["a", "b", "c"] {
            bump(&engine, name).await.unwrap();
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !path.exists() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(path.exists(), "batch save should have written the file");
        let bytes = std::fs::read(&path).unwrap();
        let on_disk = Counters::deserialize(&bytes).unwrap();
        assert_eq!(on_disk.counts.len(), 3);
        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_saves_dirty_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.msgpack");
        let config = StorageConfig::builder(&path)
            .save_interval(Duration::from_secs(5))
            .build()
            .unwrap();
        let engine = StorageEngine::<Counters>::new(config);
        engine.initialize().await.unwrap();
        bump(&engine, "a").await.unwrap();

        let mut saved = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if !engine.is_dirty().await {
                saved = true;
                break;
            }
        }
        assert!(saved, "periodic save should clear the dirty flag");
        assert!(path.exists());
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn undecodable_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.msgpack");
        std::fs::write(&path, b"definitely not msgpack").unwrap();

        let engine = StorageEngine::<Counters>::new(config_for(&path));
        engine.initialize().await.unwrap();
        assert_eq!(engine.read(|s| s.counts.len()).await, 0);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn newer_schema_is_backed_up_and_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.msgpack");
        let bytes = encode_document(
            "counters",
            &CountersDoc {
                version: 99,
                counts: BTreeMap::from([("a".to_string(), 1)]),
            },
        )
        .unwrap();
        std::fs::write(&path, &bytes).unwrap();

        let engine = StorageEngine::<Counters>::new(config_for(&path));
        engine.initialize().await.unwrap();
        assert_eq!(engine.lifecycle().await, Lifecycle::Running);
        assert_eq!(engine.read(|s| s.counts.len()).await, 0);

        let backup = dir.path().join("c.msgpack.v99.bak");
        assert_eq!(std::fs::read(&backup).unwrap(), bytes);

        bump(&engine, "b").await.unwrap();
        engine.close().await.unwrap();
        // the backup survives the save that replaces the store file
        assert_eq!(std::fs::read(&backup).unwrap(), bytes);
        let reloaded = Counters::deserialize(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(reloaded.counts.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[tokio::test]
    async fn mismatched_schema_loads_empty() {
        #[derive(Serialize)]
        struct Unrelated {
            name: String,
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.msgpack");
        let bytes = rmp_serde::to_vec_named(&Unrelated { name: "x".into() }).unwrap();
        std::fs::write(&path, bytes).unwrap();

        let engine = StorageEngine::<Counters>::new(config_for(&path));
        engine.initialize().await.unwrap();
        assert_eq!(engine.read(|s| s.counts.len()).await, 0);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn truncated_temp_leftover_does_not_affect_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.msgpack");

        let engine = StorageEngine::<Counters>::new(config_for(&path));
        engine.initialize().await.unwrap();
        bump(&engine, "a").await.unwrap();
        bump(&engine, "b").await.unwrap();
        engine.close().await.unwrap();
        let saved = std::fs::read(&path).unwrap();

        // a crash mid-write leaves a partial staging file behind
        let leftover = dir.path().join(format!("{TEMP_PREFIX}crash{TEMP_SUFFIX}"));
        std::fs::write(&leftover, &saved[..saved.len() / 2]).unwrap();

        let restarted = StorageEngine::<Counters>::new(config_for(&path));
        restarted.initialize().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), saved);
        assert_eq!(restarted.read(|s| s.counts.len()).await, 2);
        restarted.close().await.unwrap();
    }

    #[test]
    fn write_atomically_replaces_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("store.msgpack");
        std::fs::write(&dest, b"old").unwrap();

        write_atomically(&dest, dir.path(), b"new contents").unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"new contents");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn write_atomically_failure_keeps_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("store.msgpack");
        std::fs::write(&dest, b"old").unwrap();

        let missing_staging = dir.path().join("does-not-exist");
        assert!(write_atomically(&dest, &missing_staging, b"new").is_err());
        assert_eq!(std::fs::read(&dest).unwrap(), b"old");
    }

    #[tokio::test]
    async fn save_exhaustion_reports_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.msgpack");
        let config = StorageConfig::builder(&path)
            .save_interval(Duration::from_secs(3600))
            .temp_dir(Some(dir.path().join("missing-staging")))
            .save_retry_count(2)
            .save_retry_delay(Duration::from_millis(1))
            .build()
            .unwrap();
        let engine = StorageEngine::<Counters>::new(config);
        engine.initialize().await.unwrap();
        bump(&engine, "a").await.unwrap();

        let err = engine.flush().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(StorageError::SaveExhausted { attempts: 2, .. })
        ));
        // state stays dirty so a later tick can retry
        assert!(engine.is_dirty().await);

        // close reports the same failure but still stops background work
        assert!(engine.close().await.is_err());
        assert_eq!(engine.lifecycle().await, Lifecycle::Closed);
    }
}
