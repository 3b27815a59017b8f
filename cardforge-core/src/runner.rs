//! Production run: rebuild sweep, allocation, then a bounded worker pool.
//!
//! Distinct items run concurrently up to `worker.parallelism`; the phases
//! of one item are always sequential because a single future drives it.
//! Cancellation is checked before each item starts; an item already
//! running finishes its current phase chain and is checkpointed as usual.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::controller::{ControllerError, ItemReport, PhaseController};
use crate::ledger::{LedgerError, Recovery};
use crate::model::{ItemFilter, Phase, Seq};
use crate::scheduler::Scheduler;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Shared cancellation switch.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An item whose run stopped on an infrastructure error (disk, ledger).
#[derive(Debug, Clone, Serialize)]
pub struct RunError {
    pub seq: Seq,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Items reset from a transient phase when the ledger was opened.
    pub recovered: Vec<Recovery>,
    /// Items sent back to planning by the rebuild sweep.
    pub rebuilt: Vec<Seq>,
    /// Items allocated by this run.
    pub created: Vec<Seq>,
    pub items: Vec<ItemReport>,
    /// Actionable items that were not started because the run was cancelled.
    pub skipped: Vec<Seq>,
    pub errors: Vec<RunError>,
}

impl RunReport {
    pub fn count(&self, phase: Phase) -> usize {
        self.items.iter().filter(|r| r.phase == phase).count()
    }

    pub fn phase_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for report in &self.items {
            *counts.entry(report.phase.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

pub struct Runner {
    controller: Arc<PhaseController>,
    scheduler: Scheduler,
    parallelism: usize,
    cancel: CancelFlag,
}

enum Outcome {
    Finished(Result<ItemReport, ControllerError>),
    Skipped,
}

impl Runner {
    pub fn new(controller: Arc<PhaseController>, scheduler: Scheduler, parallelism: usize) -> Self {
        Self {
            controller,
            scheduler,
            parallelism: parallelism.max(1),
            cancel: CancelFlag::default(),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Allocate `new_items` cards and drive every actionable item to a
    /// resting phase.
    pub async fn run(&self, new_items: usize) -> Result<RunReport, RunnerError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let ledger = self.controller.ledger();
        info!(%run_id, new_items, parallelism = self.parallelism, "run started");

        let rebuilt = self.controller.rebuild_sweep()?;

        // Sequential so each allocation sees the previous one.
        let mut created = Vec::with_capacity(new_items);
        for _ in 0..new_items {
            let category = self.scheduler.next_category(&ledger.snapshot());
            let item = ledger.create(category)?;
            info!(seq = item.seq, rarity = %category.rarity, card_type = %category.card_type, "allocated item");
            created.push(item.seq);
        }

        let actionable: Vec<Seq> = ledger
            .list(&ItemFilter::phases(&[
                Phase::Pending,
                Phase::Planning,
                Phase::Art,
                Phase::Compositing,
                Phase::Grading,
            ]))
            .into_iter()
            .map(|i| i.seq)
            .collect();

        let outcomes: Vec<(Seq, Outcome)> = stream::iter(actionable)
            .map(|seq| {
                let controller = Arc::clone(&self.controller);
                let cancel = self.cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return (seq, Outcome::Skipped);
                    }
                    (seq, Outcome::Finished(controller.run_item(seq).await))
                }
            })
            .buffer_unordered(self.parallelism)
            .collect()
            .await;

        let mut items = Vec::new();
        let mut skipped = Vec::new();
        let mut errors = Vec::new();
        for (seq, outcome) in outcomes {
            match outcome {
                Outcome::Finished(Ok(report)) => items.push(report),
                Outcome::Finished(Err(e)) => {
                    error!(seq, error = %e, "item stopped on infrastructure error");
                    errors.push(RunError {
                        seq,
                        message: e.to_string(),
                    });
                    if let Some(item) = ledger.get(seq) {
                        items.push(ItemReport::from_item(&item));
                    }
                }
                Outcome::Skipped => skipped.push(seq),
            }
        }
        items.sort_by_key(|r| r.seq);
        skipped.sort_unstable();
        errors.sort_by_key(|e| e.seq);

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            recovered: ledger.recovered().to_vec(),
            rebuilt,
            created,
            items,
            skipped,
            errors,
        };
        info!(
            %run_id,
            done = report.count(Phase::Done),
            needs_rebuild = report.count(Phase::NeedsRebuild),
            failed = report.count(Phase::Failed),
            skipped = report.skipped.len(),
            "run finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::default();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
