//! Sync Protocol - Diff-Based Catalog Reconciliation
//!
//! 1. diff: done items with no asset, or whose content changed since the last wiring
//! 2. upload each diffed item in ledger order, skipping any that already
//!    hold an asset for the same content hash
//! 3. only when every upload succeeded: wire the deck from the complete
//!    set of done items, in batches
//!
//! Any failure halts the run. Asset ids obtained so far are already in the
//! ledger, so the next run picks up at the first item still missing one.
//! Idempotence comes from the content-hash check, not from the remote API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::collaborators::{CollaboratorError, CollaboratorResult, ErrorClass, RemoteCatalog};
use crate::config::SyncConfig;
use crate::ledger::{write_json_atomic, Ledger, LedgerError, LedgerSnapshot, SyncLease};
use crate::model::{Item, Phase, Seq};
use crate::retry::{RetryDecision, RetryPolicy};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Catalog record is corrupt: {0}")]
    Record(#[from] serde_json::Error),

    #[error("Item {0} is done but has no composite")]
    MissingComposite(Seq),
}

/// Remote containers this collection owns. `<state>/catalog.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub folder_id: Option<String>,
    pub deck_id: Option<String>,
    pub back_asset_id: Option<String>,
    pub wired_at: Option<DateTime<Utc>>,
}

impl CatalogRecord {
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| SyncError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SyncError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        write_json_atomic(path, self)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffReason {
    NeverUploaded,
    ContentChanged,
    /// Uploaded but not yet part of the wired deck.
    NotWired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffEntry {
    pub seq: Seq,
    pub title: Option<String>,
    pub reason: DiffReason,
}

/// Done items the remote catalog does not reflect, in ledger order.
pub fn sync_diff(snapshot: &LedgerSnapshot) -> Vec<DiffEntry> {
    snapshot
        .iter()
        .filter(|item| item.is_sync_dirty())
        .map(|item| DiffEntry {
            seq: item.seq,
            title: item.title().map(str::to_string),
            reason: if item.remote.asset_id.is_none() {
                DiffReason::NeverUploaded
            } else if !item.has_current_upload() {
                DiffReason::ContentChanged
            } else {
                DiffReason::NotWired
            },
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Folder,
    CardBack,
    Upload,
    Deck,
    AddCards,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub stage: SyncStage,
    pub seq: Option<Seq>,
    pub class: ErrorClass,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WiredDeck {
    pub deck_id: String,
    pub cards: usize,
    pub batches: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub diff: Vec<Seq>,
    pub uploaded: Vec<Seq>,
    /// Diffed items whose current content was already uploaded.
    pub reused: Vec<Seq>,
    pub failure: Option<SyncFailure>,
    /// Uploads finished but some done item still lacks a current asset.
    pub deferred: bool,
    pub wired: Option<WiredDeck>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && !self.deferred
    }
}

pub struct SyncProtocol {
    ledger: Arc<Ledger>,
    artifacts: ArtifactStore,
    catalog: Arc<dyn RemoteCatalog>,
    config: SyncConfig,
    record_path: PathBuf,
    retry: RetryPolicy,
}

impl SyncProtocol {
    pub fn new(
        ledger: Arc<Ledger>,
        artifacts: ArtifactStore,
        catalog: Arc<dyn RemoteCatalog>,
        config: SyncConfig,
        record_path: impl Into<PathBuf>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            artifacts,
            catalog,
            config,
            record_path: record_path.into(),
            retry,
        }
    }

    /// One reconciliation pass. Holds the sync lease for its whole duration.
    pub async fn run(&self) -> Result<SyncReport, SyncError> {
        let lease = self.ledger.acquire_sync_lease().await;
        let mut report = SyncReport::default();

        let diff: Vec<Item> = self
            .ledger
            .snapshot()
            .iter()
            .filter(|item| item.is_sync_dirty())
            .cloned()
            .collect();
        report.diff = diff.iter().map(|i| i.seq).collect();
        if diff.is_empty() {
            info!("remote catalog is up to date");
            return Ok(report);
        }
        info!(items = diff.len(), "sync diff computed");

        let mut record = CatalogRecord::load(&self.record_path)?;
        let Some(folder_id) = self.ensure_folder(&mut record, &mut report).await? else {
            return Ok(report);
        };
        if !self.ensure_card_back(&folder_id, &mut record, &mut report).await? {
            return Ok(report);
        }

        for item in &diff {
            if item.has_current_upload() {
                debug!(seq = item.seq, "asset already uploaded for this content");
                report.reused.push(item.seq);
                continue;
            }
            let composite_hash = item
                .composite_hash
                .as_deref()
                .ok_or(SyncError::MissingComposite(item.seq))?;
            let bytes = self.artifacts.read_composite(item.seq, composite_hash)?;
            let filename = format!("{:06}.png", item.seq);

            let result = self
                .with_retry("upload", || self.catalog.upload_asset(&folder_id, &filename, &bytes))
                .await;
            match result {
                Ok(asset_id) => {
                    let uploaded_hash = item.content_hash.clone();
                    self.ledger.update_remote(&lease, item.seq, |_, remote| {
                        remote.asset_id = Some(asset_id);
                        remote.uploaded_hash = uploaded_hash;
                    })?;
                    info!(seq = item.seq, "artifact uploaded");
                    report.uploaded.push(item.seq);
                }
                Err(e) => {
                    halt(&mut report, SyncStage::Upload, Some(item.seq), e);
                    return Ok(report);
                }
            }
        }

        // The deck is wired from every done item, so every one of them
        // needs a current asset, including items finished mid-run.
        let done: Vec<Item> = self
            .ledger
            .snapshot()
            .iter()
            .filter(|i| i.phase == Phase::Done)
            .cloned()
            .collect();
        let missing: Vec<Seq> = done
            .iter()
            .filter(|i| !i.has_current_upload())
            .map(|i| i.seq)
            .collect();
        if !missing.is_empty() {
            warn!(?missing, "deck wiring deferred until every card is uploaded");
            report.deferred = true;
            return Ok(report);
        }

        self.wire_deck(&lease, &done, &mut record, &mut report).await?;
        Ok(report)
    }

    async fn ensure_folder(
        &self,
        record: &mut CatalogRecord,
        report: &mut SyncReport,
    ) -> Result<Option<String>, SyncError> {
        if let Some(id) = &record.folder_id {
            return Ok(Some(id.clone()));
        }
        match self
            .with_retry("folder", || self.catalog.ensure_folder(&self.config.folder_name))
            .await
        {
            Ok(id) => {
                record.folder_id = Some(id.clone());
                record.save(&self.record_path)?;
                info!(folder_id = %id, "remote folder ready");
                Ok(Some(id))
            }
            Err(e) => {
                halt(report, SyncStage::Folder, None, e);
                Ok(None)
            }
        }
    }

    /// Upload the deck back once. Returns false when the run must halt.
    async fn ensure_card_back(
        &self,
        folder_id: &str,
        record: &mut CatalogRecord,
        report: &mut SyncReport,
    ) -> Result<bool, SyncError> {
        let Some(path) = &self.config.card_back else {
            return Ok(true);
        };
        if record.back_asset_id.is_some() {
            return Ok(true);
        }
        let bytes = fs::read(path).map_err(|source| SyncError::Io {
            path: path.clone(),
            source,
        })?;
        match self
            .with_retry("card back", || self.catalog.upload_asset(folder_id, "card_back.png", &bytes))
            .await
        {
            Ok(id) => {
                record.back_asset_id = Some(id);
                record.save(&self.record_path)?;
                Ok(true)
            }
            Err(e) => {
                halt(report, SyncStage::CardBack, None, e);
                Ok(false)
            }
        }
    }

    /// Create the deck (or clear the existing one) and add every done card.
    async fn wire_deck(
        &self,
        lease: &SyncLease,
        done: &[Item],
        record: &mut CatalogRecord,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let deck_id = match record.deck_id.clone() {
            Some(id) => {
                if let Err(e) = self.with_retry("clear deck", || self.catalog.clear_deck(&id)).await {
                    halt(report, SyncStage::Deck, None, e);
                    return Ok(());
                }
                id
            }
            None => {
                let back = record.back_asset_id.clone();
                match self
                    .with_retry("create deck", || {
                        self.catalog.create_deck(&self.config.deck_name, back.as_deref())
                    })
                    .await
                {
                    Ok(id) => {
                        record.deck_id = Some(id.clone());
                        record.save(&self.record_path)?;
                        id
                    }
                    Err(e) => {
                        halt(report, SyncStage::Deck, None, e);
                        return Ok(());
                    }
                }
            }
        };

        let mut components: Vec<(Seq, String)> = Vec::with_capacity(done.len());
        let mut batches = 0;
        for chunk in done.chunks(self.config.batch_size.max(1)) {
            let asset_ids: Vec<String> = chunk
                .iter()
                .filter_map(|i| i.remote.asset_id.clone())
                .collect();
            let result = self
                .with_retry("add cards", || self.catalog.add_cards(&deck_id, &asset_ids))
                .await
                .and_then(|ids| {
                    if ids.len() == chunk.len() {
                        Ok(ids)
                    } else {
                        Err(CollaboratorError::permanent(format!(
                            "catalog returned {} component ids for {} cards",
                            ids.len(),
                            chunk.len()
                        )))
                    }
                });
            match result {
                Ok(ids) => {
                    batches += 1;
                    components.extend(chunk.iter().map(|i| i.seq).zip(ids));
                }
                Err(e) => {
                    halt(report, SyncStage::AddCards, chunk.first().map(|i| i.seq), e);
                    return Ok(());
                }
            }
        }

        let synced_at = Utc::now();
        for (seq, component_id) in components {
            self.ledger.update_remote(lease, seq, |_, remote| {
                remote.component_id = Some(component_id);
                remote.synced_hash = remote.uploaded_hash.clone();
                remote.synced_at = Some(synced_at);
            })?;
        }
        record.wired_at = Some(synced_at);
        record.save(&self.record_path)?;

        info!(deck_id = %deck_id, cards = done.len(), batches, "deck wired");
        report.wired = Some(WiredDeck {
            deck_id,
            cards: done.len(),
            batches,
        });
        Ok(())
    }

    /// Same backoff policy as the phase controller, counted per call.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut call: F) -> CollaboratorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CollaboratorResult<T>>,
    {
        let mut attempts = 0;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempts += 1;
            match self.retry.decide(attempts, &err) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        call = what,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "catalog call failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Exhausted | RetryDecision::GiveUp => return Err(err),
            }
        }
    }
}

fn halt(report: &mut SyncReport, stage: SyncStage, seq: Option<Seq>, err: CollaboratorError) {
    warn!(stage = ?stage, seq, error = %err, "sync halted");
    report.failure = Some(SyncFailure {
        stage,
        seq,
        class: err.class,
        message: err.message,
    });
}
