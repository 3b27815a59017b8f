//! External Collaborator Interfaces
//!
//! The engine never synthesizes text or images itself and never talks to
//! the manufacturing catalog directly. These traits are the seams; hosts
//! plug in concrete clients, tests plug in fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::gate::{Deficiency, RubricCategory, ViolationKind};
use crate::model::{CardContent, Category, Seq};
use crate::reference::ReferenceSet;

/// Retry classification attached to every collaborator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ErrorClass {
    /// Network blip, timeout, 5xx.
    Transient,
    /// HTTP 429. `retry_after_ms` comes from the Retry-After header when present.
    RateLimited { retry_after_ms: Option<u64> },
    /// Malformed request or response. Never retried.
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => f.write_str("transient"),
            ErrorClass::RateLimited { .. } => f.write_str("rate_limited"),
            ErrorClass::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class} collaborator error: {message}")]
pub struct CollaboratorError {
    pub class: ErrorClass,
    pub message: String,
}

impl CollaboratorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self {
            class: ErrorClass::RateLimited { retry_after_ms },
            message: message.into(),
        }
    }

    /// Map an HTTP status to a class: 429 rate-limited, 408/5xx transient, else permanent.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        match status {
            429 => Self::rate_limited(message, retry_after_ms),
            408 | 500..=599 => Self::transient(message),
            _ => Self::permanent(message),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.class, ErrorClass::Permanent)
    }
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

// --- Text generation ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub seq: Seq,
    pub category: Category,
    /// Titles already in the collection; the new card must not repeat one.
    pub existing_titles: Vec<String>,
    /// Ability mechanics already in use (see `model::ability_pattern`), sorted.
    #[serde(default)]
    pub existing_ability_patterns: Vec<String>,
    /// Carried over from the previous grade when this is a rebuild.
    pub deficiencies: Vec<Deficiency>,
    /// Content of the previous attempt, if any.
    pub previous: Option<CardContent>,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> CollaboratorResult<CardContent>;
}

// --- Image generation ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtRequest {
    pub seq: Seq,
    pub category: Category,
    pub content: CardContent,
    /// Template first, then exemplars. Bounded by `references.max_references`.
    pub references: ReferenceSet,
    pub deficiencies: Vec<Deficiency>,
}

impl ArtRequest {
    pub fn is_rebuild(&self) -> bool {
        !self.deficiencies.is_empty()
    }
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Returns encoded raster bytes (PNG).
    async fn generate(&self, request: &ArtRequest) -> CollaboratorResult<Vec<u8>>;
}

// --- Quality judge ---

#[derive(Debug, Clone)]
pub struct JudgeRequest<'a> {
    pub seq: Seq,
    pub category: Category,
    pub content: &'a CardContent,
    pub composite: &'a [u8],
    pub references: &'a ReferenceSet,
    pub rubric: &'a BTreeMap<RubricCategory, u32>,
}

/// Raw judgement, before threshold and critical-violation policy are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgeScores {
    /// Per-category score in 0..=100 (percent of that category's weight).
    pub categories: BTreeMap<RubricCategory, u8>,
    #[serde(default)]
    pub violations: Vec<JudgeViolation>,
    #[serde(default)]
    pub corrections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeViolation {
    pub kind: ViolationKind,
    pub detail: String,
}

#[async_trait]
pub trait QualityJudge: Send + Sync {
    async fn judge(&self, request: &JudgeRequest<'_>) -> CollaboratorResult<JudgeScores>;
}

// --- Remote catalog ---

/// Catalog endpoints. Idempotence is provided by the sync protocol, which
/// deduplicates by content hash before calling.
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// Create (or find) the folder holding uploaded files.
    async fn ensure_folder(&self, name: &str) -> CollaboratorResult<String>;

    /// Multipart upload. Returns the asset id.
    async fn upload_asset(
        &self,
        folder_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> CollaboratorResult<String>;

    /// Create the deck component. Returns the deck id.
    async fn create_deck(&self, name: &str, back_asset_id: Option<&str>) -> CollaboratorResult<String>;

    /// Remove every card from an existing deck.
    async fn clear_deck(&self, deck_id: &str) -> CollaboratorResult<()>;

    /// Add cards to a deck. `asset_ids.len()` never exceeds the configured batch size.
    /// Returns one component id per asset, in order.
    async fn add_cards(&self, deck_id: &str, asset_ids: &[String]) -> CollaboratorResult<Vec<String>>;
}
