//! In-memory collaborators and a ledger-backed harness for contract tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use cardforge_core::artifacts::ArtifactStore;
use cardforge_core::collaborators::{
    ArtRequest, CollaboratorError, CollaboratorResult, ImageGenerator, JudgeRequest, JudgeScores,
    JudgeViolation, PlanRequest, QualityJudge, RemoteCatalog, TextGenerator,
};
use cardforge_core::gate::{RubricCategory, ViolationKind};
use cardforge_core::retry::RetryPolicy;
use cardforge_core::templates::{CardTemplate, TemplateRegistry, TextSlot, ValidationConfig};
use cardforge_core::{
    CardContent, Collaborators, ForgeConfig, Ledger, PhaseController, Runner, Scheduler,
    SyncProtocol,
};

/// Signature, IHDR and IEND. Enough for every check the engine makes.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let mut ihdr = b"IHDR".to_vec();
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    ihdr.extend_from_slice(&[8, 6, 0, 0, 0]);

    let mut bytes = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(&ihdr);
    bytes.extend_from_slice(&crc32fast::hash(&ihdr).to_be_bytes());
    bytes.extend_from_slice(&0u32.to_be_bytes());
    bytes.extend_from_slice(b"IEND");
    bytes.extend_from_slice(&crc32fast::hash(b"IEND").to_be_bytes());
    bytes
}

pub fn card_template() -> CardTemplate {
    CardTemplate {
        id: "card-standard".to_string(),
        name: "Standard Card".to_string(),
        description: "Portrait card frame".to_string(),
        template_version: "1.0.0".to_string(),
        engine_min_version: "1.0.0".to_string(),
        deprecated: false,
        superseded_by: None,
        rarities: vec![],
        aspect_ratio: [2, 3],
        canonical_size: [1024, 1536],
        image: PathBuf::from("card_standard.png"),
        slots: vec![TextSlot {
            name: "ability".to_string(),
            required: true,
            max_chars: Some(120),
        }],
        validation: ValidationConfig::default(),
    }
}

pub fn passing_scores() -> JudgeScores {
    JudgeScores {
        categories: BTreeMap::from([
            (RubricCategory::Formatting, 100),
            (RubricCategory::TextClarity, 95),
            (RubricCategory::ArtQuality, 95),
            (RubricCategory::ContentAlignment, 100),
        ]),
        violations: vec![],
        corrections: vec![],
    }
}

pub fn style_mismatch_scores() -> JudgeScores {
    JudgeScores {
        violations: vec![JudgeViolation {
            kind: ViolationKind::StyleMismatch,
            detail: "frame does not match template".to_string(),
        }],
        corrections: vec!["use the template border".to_string()],
        ..passing_scores()
    }
}

// --- Text ---

#[derive(Default)]
pub struct FakeText {
    pub requests: Mutex<Vec<PlanRequest>>,
    /// When set, answer with the first word missing from `existing_titles`.
    pub vocabulary: Mutex<Vec<String>>,
}

impl FakeText {
    pub fn with_vocabulary(&self, words: &[&str]) {
        *self.vocabulary.lock().unwrap() = words.iter().map(|w| w.to_string()).collect();
    }
}

#[async_trait]
impl TextGenerator for FakeText {
    async fn plan(&self, request: &PlanRequest) -> CollaboratorResult<CardContent> {
        let calls = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        let vocabulary = self.vocabulary.lock().unwrap().clone();
        let title = if vocabulary.is_empty() {
            format!("WORD{}V{}", request.seq, calls)
        } else {
            let free = vocabulary.into_iter().find(|word| {
                !request
                    .existing_titles
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(word))
            });
            // Give concurrent planners the chance to pick the same word.
            tokio::task::yield_now().await;
            free.ok_or_else(|| CollaboratorError::permanent("vocabulary exhausted"))?
        };
        Ok(CardContent {
            title,
            fields: BTreeMap::from([("ability".to_string(), "Draw a card.".to_string())]),
        })
    }
}

// --- Image ---

pub struct FakeImage {
    pub requests: Mutex<Vec<ArtRequest>>,
    /// Errors returned, in order, before answering normally.
    pub failures: Mutex<VecDeque<CollaboratorError>>,
    pub response: Mutex<Vec<u8>>,
}

impl Default for FakeImage {
    fn default() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            response: Mutex::new(png(1024, 1536)),
        }
    }
}

impl FakeImage {
    pub fn fail_with(&self, errors: impl IntoIterator<Item = CollaboratorError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ImageGenerator for FakeImage {
    async fn generate(&self, request: &ArtRequest) -> CollaboratorResult<Vec<u8>> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.response.lock().unwrap().clone())
    }
}

// --- Judge ---

#[derive(Default)]
pub struct FakeJudge {
    /// Scores returned in order; passing scores once empty.
    pub script: Mutex<VecDeque<JudgeScores>>,
    pub judged: Mutex<Vec<u64>>,
}

impl FakeJudge {
    pub fn then(&self, scores: JudgeScores) {
        self.script.lock().unwrap().push_back(scores);
    }
}

#[async_trait]
impl QualityJudge for FakeJudge {
    async fn judge(&self, request: &JudgeRequest<'_>) -> CollaboratorResult<JudgeScores> {
        self.judged.lock().unwrap().push(request.seq);
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(passing_scores))
    }
}

// --- Catalog ---

#[derive(Default)]
pub struct CatalogState {
    /// Filenames of every successful upload, in order.
    pub uploads: Vec<String>,
    /// Every upload attempt, including failed ones.
    pub attempts: Vec<String>,
    /// Filenames that fail permanently.
    pub failing: HashSet<String>,
    pub transient_failures: usize,
    pub folders: usize,
    pub decks_created: Vec<Option<String>>,
    pub cleared: usize,
    pub batches: Vec<Vec<String>>,
}

#[derive(Default)]
pub struct FakeCatalog {
    pub state: Mutex<CatalogState>,
}

impl FakeCatalog {
    pub fn state(&self) -> std::sync::MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl RemoteCatalog for FakeCatalog {
    async fn ensure_folder(&self, name: &str) -> CollaboratorResult<String> {
        self.state().folders += 1;
        Ok(format!("folder-{}", name))
    }

    async fn upload_asset(&self, _folder_id: &str, filename: &str, _bytes: &[u8]) -> CollaboratorResult<String> {
        let mut state = self.state();
        state.attempts.push(filename.to_string());
        if state.failing.contains(filename) {
            return Err(CollaboratorError::from_status(400, "rejected", None));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(CollaboratorError::from_status(503, "unavailable", None));
        }
        state.uploads.push(filename.to_string());
        Ok(format!("asset-{}-{}", state.uploads.len(), filename))
    }

    async fn create_deck(&self, _name: &str, back_asset_id: Option<&str>) -> CollaboratorResult<String> {
        let mut state = self.state();
        state.decks_created.push(back_asset_id.map(str::to_string));
        Ok(format!("deck-{}", state.decks_created.len()))
    }

    async fn clear_deck(&self, _deck_id: &str) -> CollaboratorResult<()> {
        self.state().cleared += 1;
        Ok(())
    }

    async fn add_cards(&self, _deck_id: &str, asset_ids: &[String]) -> CollaboratorResult<Vec<String>> {
        self.state().batches.push(asset_ids.to_vec());
        Ok(asset_ids.iter().map(|id| format!("component-{}", id)).collect())
    }
}

// --- Harness ---

pub fn test_config(state_dir: PathBuf) -> ForgeConfig {
    let mut config = ForgeConfig::default();
    config.core.state_dir = state_dir;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.jitter_ms = 0;
    config.worker.parallelism = 2;
    config
}

pub struct Harness {
    pub dir: TempDir,
    pub config: ForgeConfig,
    pub ledger: Arc<Ledger>,
    pub text: Arc<FakeText>,
    pub image: Arc<FakeImage>,
    pub judge: Arc<FakeJudge>,
    pub controller: Arc<PhaseController>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut ForgeConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::open(dir, tweak)
    }

    /// Open a harness over an existing state directory.
    pub fn open(dir: TempDir, tweak: impl FnOnce(&mut ForgeConfig)) -> Self {
        let mut config = test_config(dir.path().join("state"));
        tweak(&mut config);
        config.validate().unwrap();

        let ledger = Arc::new(Ledger::open(config.ledger_dir()).unwrap());
        let mut templates = TemplateRegistry::new(dir.path().join("templates"), "card-standard");
        templates.register(card_template());

        let text = Arc::new(FakeText::default());
        let image = Arc::new(FakeImage::default());
        let judge = Arc::new(FakeJudge::default());
        let collaborators = Collaborators {
            text: text.clone(),
            image: image.clone(),
            judge: judge.clone(),
        };
        let controller = Arc::new(PhaseController::new(
            Arc::clone(&ledger),
            ArtifactStore::new(config.artifacts_dir()),
            Arc::new(templates),
            collaborators,
            &config,
        ));

        Self {
            dir,
            config,
            ledger,
            text,
            image,
            judge,
            controller,
        }
    }

    pub fn runner(&self) -> Runner {
        Runner::new(
            Arc::clone(&self.controller),
            Scheduler::from_config(&self.config.quotas),
            self.config.worker.parallelism,
        )
    }

    pub fn sync(&self, catalog: Arc<FakeCatalog>) -> SyncProtocol {
        SyncProtocol::new(
            Arc::clone(&self.ledger),
            ArtifactStore::new(self.config.artifacts_dir()),
            catalog,
            self.config.sync.clone(),
            self.config.catalog_path(),
            RetryPolicy::from_config(&self.config.retry),
        )
    }

    /// Drop the ledger (releasing its lock) and keep the state directory.
    pub fn into_dir(self) -> TempDir {
        self.dir
    }
}
