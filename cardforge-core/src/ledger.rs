//! Item Ledger - Durable Per-Item Records
//!
//! One JSON file per item under `<state>/ledger`, written atomically
//! (temp file + rename). An in-memory index mirrors the files and is
//! updated after every successful write, so aggregate reads see a
//! consistent snapshot without a global write lock.
//!
//! Locking:
//! - per-item mutex serializes read-modify-write of the same item
//! - a title mutex serializes commits that must keep titles unique
//! - an advisory file lock keeps a second process off the same ledger
//! - the sync lease gates every write to remote linkage fields

use chrono::Utc;
use dashmap::DashMap;
use fs2::FileExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{CardContent, Category, Item, ItemFilter, Phase, RemoteLinkage, Seq};

const LOCK_FILE: &str = ".lock";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Ledger at {0} is held by another process")]
    Locked(PathBuf),

    #[error("Item {0} not found")]
    NotFound(Seq),

    #[error("Item {seq}: illegal transition {from} -> {to}")]
    InvalidTransition { seq: Seq, from: Phase, to: Phase },

    #[error("Item {seq}: {message}")]
    Invariant { seq: Seq, message: String },

    #[error("Item {seq}: title {title} is already taken by item {holder}")]
    DuplicateTitle { seq: Seq, title: String, holder: Seq },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `value` as pretty JSON to `path` via a temp file and rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), LedgerError> {
    let tmp_path = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, bytes).map_err(io_err(&tmp_path))?;
    fs::rename(&tmp_path, path).map_err(io_err(path))?;
    Ok(())
}

/// An item found mid-phase when the ledger was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recovery {
    pub seq: Seq,
    pub phase: Phase,
}

/// Exclusive right to write remote linkage. Held for a whole sync run.
pub struct SyncLease {
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

/// Consistent point-in-time copy of every item, in sequence order.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub items: Vec<Item>,
}

impl LedgerSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.items.iter()
    }

    pub fn filter<'a>(&'a self, filter: &'a ItemFilter) -> impl Iterator<Item = &'a Item> + 'a {
        self.items.iter().filter(move |i| filter.matches(i))
    }

    pub fn count(&self, phase: Phase) -> usize {
        self.items.iter().filter(|i| i.phase == phase).count()
    }

    /// Per-phase counts, derived on demand.
    pub fn phase_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.items {
            *counts.entry(item.phase.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

pub struct Ledger {
    dir: PathBuf,
    index: RwLock<BTreeMap<Seq, Item>>,
    item_locks: DashMap<Seq, Arc<Mutex<()>>>,
    alloc: Mutex<()>,
    titles: Mutex<()>,
    sync_lease: Arc<tokio::sync::Mutex<()>>,
    recovered: Vec<Recovery>,
    _process_lock: File,
}

impl Ledger {
    /// Open (creating if needed) the ledger in `dir`, then reset every item
    /// left in a transient phase to the start of that phase.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let lock_path = dir.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_err(&lock_path))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| LedgerError::Locked(dir.clone()))?;

        let mut items = BTreeMap::new();
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let path = entry.map_err(io_err(&dir))?.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            let raw = fs::read_to_string(&path).map_err(io_err(&path))?;
            let item: Item = serde_json::from_str(&raw)?;
            items.insert(item.seq, item);
        }

        let mut ledger = Self {
            dir,
            index: RwLock::new(items),
            item_locks: DashMap::new(),
            alloc: Mutex::new(()),
            titles: Mutex::new(()),
            sync_lease: Arc::new(tokio::sync::Mutex::new(())),
            recovered: Vec::new(),
            _process_lock: lock_file,
        };
        ledger.recovered = ledger.recover_crashed()?;
        info!(
            dir = %ledger.dir.display(),
            items = ledger.read_index().len(),
            recovered = ledger.recovered.len(),
            "ledger opened"
        );
        Ok(ledger)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Items reset by crash recovery when this ledger was opened.
    pub fn recovered(&self) -> &[Recovery] {
        &self.recovered
    }

    pub fn get(&self, seq: Seq) -> Option<Item> {
        self.read_index().get(&seq).cloned()
    }

    pub fn list(&self, filter: &ItemFilter) -> Vec<Item> {
        self.read_index()
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            items: self.read_index().values().cloned().collect(),
        }
    }

    /// Allocate the next sequence number and persist a new pending item.
    pub fn create(&self, category: Category) -> Result<Item, LedgerError> {
        let _alloc = lock(&self.alloc);
        let seq = self
            .read_index()
            .keys()
            .next_back()
            .map_or(1, |last| last + 1);
        let item = Item::new(seq, category);
        self.persist(&item)?;
        debug!(seq, category = %category, "item created");
        Ok(item)
    }

    /// Write a whole item. Remote linkage is never taken from `item`; the
    /// stored linkage (if any) is kept.
    pub fn upsert(&self, mut item: Item) -> Result<Item, LedgerError> {
        let item_lock = self.item_lock(item.seq);
        let _guard = lock(&item_lock);
        match self.get(item.seq) {
            Some(current) => {
                check_transition(&current, &item)?;
                item.remote = current.remote;
            }
            None => item.remote = RemoteLinkage::default(),
        }
        check_invariants(&item)?;
        item.updated_at = Utc::now();
        self.persist(&item)?;
        Ok(item)
    }

    /// Atomic read-modify-write of one item. `f` may change anything but
    /// remote linkage, which is restored from the stored record.
    pub fn update<F>(&self, seq: Seq, f: F) -> Result<Item, LedgerError>
    where
        F: FnOnce(&mut Item),
    {
        self.update_checked(seq, f, |_| Ok(()))
    }

    /// `update` that fails with `DuplicateTitle` when another item already
    /// holds the resulting title. Commits through here run one at a time, so
    /// two concurrent planners can never both keep the same word.
    pub fn update_with_unique_title<F>(&self, seq: Seq, f: F) -> Result<Item, LedgerError>
    where
        F: FnOnce(&mut Item),
    {
        let _titles = lock(&self.titles);
        self.update_checked(seq, f, |next| {
            let Some(title) = next.content.as_ref().map(CardContent::normalized_title) else {
                return Ok(());
            };
            let holder = self
                .read_index()
                .values()
                .filter(|other| other.seq != next.seq)
                .find(|other| {
                    other
                        .content
                        .as_ref()
                        .map_or(false, |c| c.normalized_title() == title)
                })
                .map(|other| other.seq);
            match holder {
                Some(holder) => Err(LedgerError::DuplicateTitle {
                    seq: next.seq,
                    title,
                    holder,
                }),
                None => Ok(()),
            }
        })
    }

    fn update_checked<F, C>(&self, seq: Seq, f: F, check: C) -> Result<Item, LedgerError>
    where
        F: FnOnce(&mut Item),
        C: FnOnce(&Item) -> Result<(), LedgerError>,
    {
        let item_lock = self.item_lock(seq);
        let _guard = lock(&item_lock);
        let current = self.get(seq).ok_or(LedgerError::NotFound(seq))?;
        let mut next = current.clone();
        f(&mut next);
        next.seq = current.seq;
        next.remote = current.remote.clone();
        check_transition(&current, &next)?;
        check_invariants(&next)?;
        check(&next)?;
        next.updated_at = Utc::now();
        self.persist(&next)?;
        Ok(next)
    }

    /// Read-modify-write of remote linkage only. Requires the sync lease.
    pub fn update_remote<F>(&self, _lease: &SyncLease, seq: Seq, f: F) -> Result<Item, LedgerError>
    where
        F: FnOnce(&Item, &mut RemoteLinkage),
    {
        let item_lock = self.item_lock(seq);
        let _guard = lock(&item_lock);
        let mut item = self.get(seq).ok_or(LedgerError::NotFound(seq))?;
        let mut remote = item.remote.clone();
        f(&item, &mut remote);
        item.remote = remote;
        item.updated_at = Utc::now();
        self.persist(&item)?;
        Ok(item)
    }

    /// Wait for exclusive access to remote linkage.
    pub async fn acquire_sync_lease(&self) -> SyncLease {
        SyncLease {
            _guard: Arc::clone(&self.sync_lease).lock_owned().await,
        }
    }

    pub fn try_acquire_sync_lease(&self) -> Option<SyncLease> {
        Arc::clone(&self.sync_lease)
            .try_lock_owned()
            .ok()
            .map(|guard| SyncLease { _guard: guard })
    }

    /// Operator action: send a failed item back to `pending` with a fresh retry budget.
    pub fn requeue(&self, seq: Seq) -> Result<Item, LedgerError> {
        let current = self.get(seq).ok_or(LedgerError::NotFound(seq))?;
        if current.phase != Phase::Failed {
            return Err(LedgerError::InvalidTransition {
                seq,
                from: current.phase,
                to: Phase::Pending,
            });
        }
        let item = self.update(seq, |item| {
            item.phase = Phase::Pending;
            item.retry.clear();
            item.failure = None;
        })?;
        info!(seq, "item requeued");
        Ok(item)
    }

    fn recover_crashed(&self) -> Result<Vec<Recovery>, LedgerError> {
        let stuck: Vec<Item> = self
            .read_index()
            .values()
            .filter(|i| i.phase.is_transient())
            .cloned()
            .collect();

        let mut recovered = Vec::with_capacity(stuck.len());
        for mut item in stuck {
            // Outputs of the interrupted phase and everything after it are stale.
            match item.phase {
                Phase::Art => {
                    item.art_hash = None;
                    item.composite_hash = None;
                    item.grade = None;
                }
                Phase::Compositing => {
                    item.composite_hash = None;
                    item.grade = None;
                }
                Phase::Grading => item.grade = None,
                _ => {}
            }
            item.recoveries += 1;
            item.updated_at = Utc::now();
            self.persist(&item)?;
            warn!(seq = item.seq, phase = %item.phase, "item was mid-phase at startup; restarting phase");
            recovered.push(Recovery {
                seq: item.seq,
                phase: item.phase,
            });
        }
        Ok(recovered)
    }

    fn item_path(&self, seq: Seq) -> PathBuf {
        self.dir.join(format!("{:06}.json", seq))
    }

    /// Durable write first, then publish to the index.
    fn persist(&self, item: &Item) -> Result<(), LedgerError> {
        write_json_atomic(&self.item_path(item.seq), item)?;
        self.write_index().insert(item.seq, item.clone());
        Ok(())
    }

    fn item_lock(&self, seq: Seq) -> Arc<Mutex<()>> {
        self.item_locks.entry(seq).or_default().value().clone()
    }

    fn read_index(&self) -> RwLockReadGuard<'_, BTreeMap<Seq, Item>> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, BTreeMap<Seq, Item>> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_transition(current: &Item, next: &Item) -> Result<(), LedgerError> {
    if current.phase != next.phase && !current.phase.can_transition_to(next.phase) {
        return Err(LedgerError::InvalidTransition {
            seq: current.seq,
            from: current.phase,
            to: next.phase,
        });
    }
    if current.category != next.category {
        return Err(LedgerError::Invariant {
            seq: current.seq,
            message: "category is fixed at creation".to_string(),
        });
    }
    Ok(())
}

fn check_invariants(item: &Item) -> Result<(), LedgerError> {
    if item.phase == Phase::Done && !item.grade.as_ref().map_or(false, |g| g.pass) {
        return Err(LedgerError::Invariant {
            seq: item.seq,
            message: "done requires a passing grade".to_string(),
        });
    }
    Ok(())
}
