//! Phase Controller - Per-Item State Machine
//!
//! pending -> planning -> art -> compositing -> grading -> {done | needs_rebuild}
//!
//! CRITICAL: every transition is written to the ledger before the next
//! phase starts, together with the outputs of the phase that just
//! finished. A crash therefore loses at most the phase in flight, which
//! the ledger resets on the next open.
//!
//! Retry bookkeeping lives on the item (`RetryState`), not in this call
//! stack: after a restart the controller resumes with the attempts that
//! were already spent.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::collaborators::{
    ArtRequest, CollaboratorError, CollaboratorResult, ErrorClass, ImageGenerator, JudgeRequest,
    PlanRequest, QualityJudge, TextGenerator,
};
use crate::composite::Compositor;
use crate::config::ForgeConfig;
use crate::gate::QualityGate;
use crate::hashing::compute_content_hash;
use crate::ledger::{Ledger, LedgerError};
use crate::model::{
    normalize_title, CardContent, Category, FailureClass, Item, ItemFailure, ItemFilter, Phase, Seq,
};
use crate::reference::{ReferenceSelector, ReferenceSet};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::templates::{CardTemplate, TemplateRegistry};
use crate::validation::png_dimensions;

/// Infrastructure failures. Item-level failures are recorded on the item
/// and reported through `ItemReport`, not returned as errors.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Hashing error: {0}")]
    Hash(#[from] serde_json::Error),

    #[error("Item {seq} is in {phase} without {missing}")]
    MissingOutput {
        seq: Seq,
        phase: Phase,
        missing: &'static str,
    },
}

/// The collaborators one controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub text: Arc<dyn TextGenerator>,
    pub image: Arc<dyn ImageGenerator>,
    pub judge: Arc<dyn QualityJudge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemErrorReport {
    pub phase: Phase,
    pub class: FailureClass,
    pub message: String,
}

/// Final state of one item after a run touched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub seq: Seq,
    pub category: Category,
    pub phase: Phase,
    pub title: Option<String>,
    pub score: Option<u32>,
    /// Deficiency tags of the last grade; set for `needs_rebuild`.
    pub deficiencies: Vec<String>,
    pub rebuilds: u32,
    pub error: Option<ItemErrorReport>,
}

impl ItemReport {
    pub fn from_item(item: &Item) -> Self {
        let deficiencies = match (&item.grade, item.phase) {
            (Some(grade), Phase::NeedsRebuild | Phase::Done) => grade.tags(),
            _ => Vec::new(),
        };
        Self {
            seq: item.seq,
            category: item.category,
            phase: item.phase,
            title: item.title().map(str::to_string),
            score: item.grade.as_ref().map(|g| g.score),
            deficiencies,
            rebuilds: item.rebuilds,
            error: item.failure.as_ref().map(|f| ItemErrorReport {
                phase: f.phase,
                class: f.class,
                message: f.message.clone(),
            }),
        }
    }
}

pub struct PhaseController {
    ledger: Arc<Ledger>,
    artifacts: ArtifactStore,
    templates: Arc<TemplateRegistry>,
    collaborators: Collaborators,
    selector: ReferenceSelector,
    compositor: Compositor,
    gate: QualityGate,
    retry: RetryPolicy,
    #[cfg(feature = "test-hooks")]
    gate_calls: AtomicUsize,
}

impl PhaseController {
    pub fn new(
        ledger: Arc<Ledger>,
        artifacts: ArtifactStore,
        templates: Arc<TemplateRegistry>,
        collaborators: Collaborators,
        config: &ForgeConfig,
    ) -> Self {
        Self {
            ledger,
            artifacts,
            templates,
            collaborators,
            selector: ReferenceSelector::new(config.references.max_references),
            compositor: Compositor::new(),
            gate: QualityGate::new(&config.rubric),
            retry: RetryPolicy::from_config(&config.retry),
            #[cfg(feature = "test-hooks")]
            gate_calls: AtomicUsize::new(0),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Number of quality-gate evaluations so far.
    #[cfg(feature = "test-hooks")]
    pub fn gate_calls(&self) -> usize {
        self.gate_calls.load(Ordering::SeqCst)
    }

    /// Move every `needs_rebuild` item back to `planning`, carrying the
    /// deficiencies of its last grade as rebuild hints.
    pub fn rebuild_sweep(&self) -> Result<Vec<Seq>, ControllerError> {
        let mut swept = Vec::new();
        for item in self.ledger.list(&ItemFilter::phase(Phase::NeedsRebuild)) {
            let updated = self.ledger.update(item.seq, |i| {
                i.rebuild_hints = i
                    .grade
                    .as_ref()
                    .map(|g| g.deficiencies.clone())
                    .unwrap_or_default();
                i.rebuilds += 1;
                i.retry.clear();
                i.phase = Phase::Planning;
            })?;
            info!(
                seq = updated.seq,
                rebuilds = updated.rebuilds,
                hints = updated.rebuild_hints.len(),
                "item queued for rebuild"
            );
            swept.push(updated.seq);
        }
        Ok(swept)
    }

    /// Drive one item until it reaches `done`, `needs_rebuild` or `failed`.
    pub async fn run_item(&self, seq: Seq) -> Result<ItemReport, ControllerError> {
        loop {
            let item = self.ledger.get(seq).ok_or(LedgerError::NotFound(seq))?;
            debug!(seq, phase = %item.phase, "advancing item");
            match item.phase {
                Phase::Pending => {
                    self.ledger.update(seq, |i| i.phase = Phase::Planning)?;
                }
                Phase::Planning => self.plan(&item).await?,
                Phase::Art => self.art(&item).await?,
                Phase::Compositing => self.composite(&item)?,
                Phase::Grading => self.grade(&item).await?,
                Phase::Done | Phase::NeedsRebuild | Phase::Failed => {
                    return Ok(ItemReport::from_item(&item));
                }
            }
        }
    }

    async fn plan(&self, item: &Item) -> Result<(), ControllerError> {
        let (text, ledger) = (&self.collaborators.text, &self.ledger);
        let outcome = self
            .call_with_retry(item.seq, Phase::Planning, || {
                // Rebuilt per attempt so a retry sees titles committed meanwhile.
                let request = self.plan_request(item);
                async move {
                    let content = text.plan(&request).await?;
                    check_content(&content, &request.existing_titles)?;
                    let content_hash = match compute_content_hash(&item.category, &content, None) {
                        Ok(hash) => hash,
                        Err(e) => return Ok(Err(ControllerError::from(e))),
                    };
                    let committed = ledger.update_with_unique_title(item.seq, |i| {
                        i.content = Some(content);
                        i.content_hash = Some(content_hash);
                        i.art_hash = None;
                        i.composite_hash = None;
                        i.grade = None;
                        i.retry.clear();
                        i.phase = Phase::Art;
                    });
                    match committed {
                        Ok(_) => Ok::<_, CollaboratorError>(Ok(())),
                        // Another worker committed the same word first.
                        Err(LedgerError::DuplicateTitle { title, holder, .. }) => {
                            Err(CollaboratorError::transient(format!(
                                "text collaborator repeated title {} of item {}",
                                title, holder
                            )))
                        }
                        Err(e) => Ok(Err(ControllerError::from(e))),
                    }
                }
            })
            .await?;
        outcome.unwrap_or(Ok(()))
    }

    /// Planning input from a fresh snapshot: every other item's title and
    /// ability mechanic, plus the hints of a rebuild.
    fn plan_request(&self, item: &Item) -> PlanRequest {
        let snapshot = self.ledger.snapshot();
        let others: Vec<&CardContent> = snapshot
            .iter()
            .filter(|other| other.seq != item.seq)
            .filter_map(|other| other.content.as_ref())
            .collect();
        let patterns: BTreeSet<String> = others.iter().filter_map(|c| c.ability_pattern()).collect();

        PlanRequest {
            seq: item.seq,
            category: item.category,
            existing_titles: others.iter().map(|c| c.title.clone()).collect(),
            existing_ability_patterns: patterns.into_iter().collect(),
            deficiencies: item.rebuild_hints.clone(),
            previous: item.content.clone(),
        }
    }

    async fn art(&self, item: &Item) -> Result<(), ControllerError> {
        let content = required(item, item.content.as_ref(), "content")?;
        let Some(template) = self.template_for(item)? else {
            return Ok(());
        };

        let request = ArtRequest {
            seq: item.seq,
            category: item.category,
            content: content.clone(),
            references: self.references(item, template),
            deficiencies: item.rebuild_hints.clone(),
        };
        if request.is_rebuild() {
            info!(
                seq = item.seq,
                hints = ?request.deficiencies.iter().map(|d| d.tag()).collect::<Vec<_>>(),
                "regenerating art with deficiencies"
            );
        }

        let (image, request) = (&self.collaborators.image, &request);
        let outcome = self
            .call_with_retry(item.seq, Phase::Art, || async move {
                let bytes = image.generate(request).await?;
                if bytes.is_empty() {
                    return Err(CollaboratorError::transient("image collaborator returned no data"));
                }
                if png_dimensions(&bytes).is_none() {
                    return Err(CollaboratorError::transient(format!(
                        "image collaborator returned {} bytes that are not a PNG",
                        bytes.len()
                    )));
                }
                Ok::<_, CollaboratorError>(bytes)
            })
            .await?;
        let Some(bytes) = outcome else {
            return Ok(());
        };

        let art_hash = self.artifacts.write_art(item.seq, &bytes)?;
        let content_hash = compute_content_hash(&item.category, content, Some(&art_hash))?;
        self.ledger.update(item.seq, |i| {
            i.art_hash = Some(art_hash);
            i.content_hash = Some(content_hash);
            i.retry.clear();
            i.phase = Phase::Compositing;
        })?;
        Ok(())
    }

    /// Local and deterministic: validation errors fail the item outright.
    fn composite(&self, item: &Item) -> Result<(), ControllerError> {
        let content = required(item, item.content.as_ref(), "content")?;
        let art_hash = required(item, item.art_hash.as_ref(), "art")?;
        let Some(template) = self.template_for(item)? else {
            return Ok(());
        };

        let art = self.artifacts.read_art(item.seq, art_hash)?;
        match self.compositor.compose(template, item.category, &art, content) {
            Ok(composite) => {
                self.artifacts.write_composite(item.seq, &composite)?;
                for warning in &composite.manifest.warnings {
                    warn!(seq = item.seq, rule = %warning.rule, "{}", warning.message);
                }
                self.ledger.update(item.seq, |i| {
                    i.composite_hash = Some(composite.hash.clone());
                    i.phase = Phase::Grading;
                })?;
            }
            Err(e) => {
                self.fail(item.seq, Phase::Compositing, FailureClass::Permanent, e.to_string())?;
            }
        }
        Ok(())
    }

    async fn grade(&self, item: &Item) -> Result<(), ControllerError> {
        let content = required(item, item.content.as_ref(), "content")?;
        let composite_hash = required(item, item.composite_hash.as_ref(), "composite")?;
        let Some(template) = self.template_for(item)? else {
            return Ok(());
        };

        let composite = self.artifacts.read_composite(item.seq, composite_hash)?;
        let references = self.references(item, template);
        let request = JudgeRequest {
            seq: item.seq,
            category: item.category,
            content,
            composite: &composite,
            references: &references,
            rubric: self.gate.weights(),
        };

        let (judge, request) = (&self.collaborators.judge, &request);
        let Some(scores) = self
            .call_with_retry(item.seq, Phase::Grading, || judge.judge(request))
            .await?
        else {
            return Ok(());
        };

        let grade = self.gate.evaluate(&scores);
        #[cfg(feature = "test-hooks")]
        self.gate_calls.fetch_add(1, Ordering::SeqCst);

        if grade.pass {
            info!(seq = item.seq, score = grade.score, "card passed quality gate");
            self.ledger.update(item.seq, |i| {
                i.grade = Some(grade);
                i.rebuild_hints.clear();
                i.retry.clear();
                i.completed_at = Some(Utc::now());
                i.phase = Phase::Done;
            })?;
        } else {
            warn!(
                seq = item.seq,
                score = grade.score,
                deficiencies = ?grade.tags(),
                "card rejected by quality gate"
            );
            self.ledger.update(item.seq, |i| {
                i.grade = Some(grade);
                i.retry.clear();
                i.phase = Phase::NeedsRebuild;
            })?;
        }
        Ok(())
    }

    /// Call a collaborator until it succeeds or the retry policy gives up.
    /// Every failed attempt is persisted before sleeping. Returns `None`
    /// when the item has been marked failed.
    async fn call_with_retry<T, F, Fut>(
        &self,
        seq: Seq,
        phase: Phase,
        mut call: F,
    ) -> Result<Option<T>, ControllerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CollaboratorResult<T>>,
    {
        let spent = self
            .ledger
            .get(seq)
            .map_or(0, |i| i.retry.attempts_for(phase));
        if spent >= self.retry.max_attempts {
            let last = self
                .ledger
                .get(seq)
                .and_then(|i| i.retry.last_error)
                .unwrap_or_else(|| "retry budget already spent".to_string());
            self.fail(seq, phase, FailureClass::Exhausted, last)?;
            return Ok(None);
        }

        loop {
            let err = match call().await {
                Ok(value) => return Ok(Some(value)),
                Err(err) => err,
            };
            let item = self.ledger.update(seq, |i| i.retry.record_failure(phase, &err))?;
            let attempts = item.retry.attempts;

            match self.retry.decide(attempts, &err) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        seq,
                        phase = %phase,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        rate_limited = matches!(err.class, ErrorClass::RateLimited { .. }),
                        error = %err,
                        "collaborator call failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Exhausted => {
                    self.fail(seq, phase, FailureClass::Exhausted, err.to_string())?;
                    return Ok(None);
                }
                RetryDecision::GiveUp => {
                    self.fail(seq, phase, FailureClass::Permanent, err.to_string())?;
                    return Ok(None);
                }
            }
        }
    }

    fn fail(
        &self,
        seq: Seq,
        phase: Phase,
        class: FailureClass,
        message: String,
    ) -> Result<(), ControllerError> {
        error!(seq, phase = %phase, class = ?class, error = %message, "item failed");
        self.ledger.update(seq, |i| {
            i.failure = Some(ItemFailure {
                phase,
                class,
                message,
                at: Utc::now(),
            });
            i.phase = Phase::Failed;
        })?;
        Ok(())
    }

    /// Template for the item's category. A missing template fails the item.
    fn template_for(&self, item: &Item) -> Result<Option<&CardTemplate>, ControllerError> {
        match self.templates.for_category(&item.category) {
            Some(template) => Ok(Some(template)),
            None => {
                self.fail(
                    item.seq,
                    item.phase,
                    FailureClass::Permanent,
                    format!("no card template for {}", item.category),
                )?;
                Ok(None)
            }
        }
    }

    fn references(&self, item: &Item, template: &CardTemplate) -> ReferenceSet {
        self.selector.select(
            &item.category,
            Some(item.seq),
            &self.ledger.snapshot(),
            &self.templates.image_path(template),
            &self.artifacts,
        )
    }
}

fn required<'a, T>(item: &Item, value: Option<&'a T>, missing: &'static str) -> Result<&'a T, ControllerError> {
    value.ok_or(ControllerError::MissingOutput {
        seq: item.seq,
        phase: item.phase,
        missing,
    })
}

/// Reject unusable planning output. Retried like any transient failure.
fn check_content(content: &CardContent, existing_titles: &[String]) -> CollaboratorResult<()> {
    let title = content.normalized_title();
    if title.is_empty() {
        return Err(CollaboratorError::transient("text collaborator returned an empty title"));
    }
    if existing_titles.iter().any(|t| normalize_title(t) == title) {
        return Err(CollaboratorError::transient(format!(
            "text collaborator repeated existing title {}",
            title
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CardType, Rarity};
    use std::collections::BTreeMap;

    fn content(title: &str) -> CardContent {
        CardContent {
            title: title.to_string(),
            fields: BTreeMap::new(),
        }
    }

    #[test]
    fn test_check_content_rejects_duplicates_case_insensitively() {
        let taken = vec!["Lantern".to_string()];
        let err = check_content(&content(" lantern "), &taken).unwrap_err();
        assert!(err.is_retryable());
        assert!(check_content(&content("EMBER"), &taken).is_ok());
    }

    #[test]
    fn test_check_content_rejects_empty_title() {
        assert!(check_content(&content("  "), &[]).is_err());
    }

    #[test]
    fn test_report_includes_failure() {
        let mut item = Item::new(4, Category::new(CardType::Noun, Rarity::Rare));
        item.phase = Phase::Failed;
        item.failure = Some(ItemFailure {
            phase: Phase::Art,
            class: FailureClass::Exhausted,
            message: "transient collaborator error: timeout".to_string(),
            at: Utc::now(),
        });
        let report = ItemReport::from_item(&item);
        assert_eq!(report.phase, Phase::Failed);
        assert_eq!(report.error.unwrap().class, FailureClass::Exhausted);
    }
}
