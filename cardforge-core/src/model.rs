//! Item Model - Cards Under Production
//!
//! An item is created once, never deleted, and only moves forward through
//! its phases (plus the `needs_rebuild -> planning` recycle edge and the
//! operator-driven `failed -> pending` requeue).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::gate::{Deficiency, GradeResult};
use crate::retry::RetryState;

/// Monotonic sequence number. Stable and never reused.
pub type Seq = u64;

/// Card type. Declaration order is the scheduler's tie-break priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardType {
    Noun,
    Verb,
    Adjective,
    Name,
    Title,
}

impl CardType {
    pub const ALL: [CardType; 5] = [
        CardType::Noun,
        CardType::Verb,
        CardType::Adjective,
        CardType::Name,
        CardType::Title,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CardType::Noun => "NOUN",
            CardType::Verb => "VERB",
            CardType::Adjective => "ADJECTIVE",
            CardType::Name => "NAME",
            CardType::Title => "TITLE",
        }
    }
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rarity tier, ordered from most to least common.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    Glorious,
}

impl Rarity {
    pub const ALL: [Rarity; 4] = [Rarity::Common, Rarity::Uncommon, Rarity::Rare, Rarity::Glorious];

    pub fn as_str(&self) -> &'static str {
        match self {
            Rarity::Common => "COMMON",
            Rarity::Uncommon => "UNCOMMON",
            Rarity::Rare => "RARE",
            Rarity::Glorious => "GLORIOUS",
        }
    }
}

impl fmt::Display for Rarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category attributes of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Category {
    pub card_type: CardType,
    pub rarity: Rarity,
}

impl Category {
    pub fn new(card_type: CardType, rarity: Rarity) -> Self {
        Self { card_type, rarity }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.card_type, self.rarity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Planning,
    Art,
    Compositing,
    Grading,
    Done,
    NeedsRebuild,
    Failed,
}

impl Phase {
    /// Phases that are only ever occupied while a worker is running the item.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Phase::Planning | Phase::Art | Phase::Compositing | Phase::Grading
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::NeedsRebuild | Phase::Failed)
    }

    /// Allowed transitions. Anything else is a bug in the caller.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Pending, Planning) => true,
            (Planning, Art) => true,
            (Art, Compositing) => true,
            (Compositing, Grading) => true,
            (Grading, Done) | (Grading, NeedsRebuild) => true,
            (NeedsRebuild, Planning) => true,
            (Failed, Pending) => true,
            (from, Failed) => !matches!(from, Done | Failed),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Planning => "planning",
            Phase::Art => "art",
            Phase::Compositing => "compositing",
            Phase::Grading => "grading",
            Phase::Done => "done",
            Phase::NeedsRebuild => "needs_rebuild",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured card text produced by the planning collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardContent {
    /// The card word; also used for duplicate avoidance.
    pub title: String,
    /// Named text slots (ability, flavor, trivia, ...).
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl CardContent {
    pub const ABILITY_FIELD: &'static str = "ability";

    pub fn normalized_title(&self) -> String {
        normalize_title(&self.title)
    }

    /// Mechanic signature of the ability slot, `None` without ability text.
    pub fn ability_pattern(&self) -> Option<String> {
        self.fields
            .get(Self::ABILITY_FIELD)
            .map(String::as_str)
            .map(ability_pattern)
            .filter(|pattern| !pattern.is_empty())
    }
}

/// Titles compare trimmed and case-insensitively.
pub fn normalize_title(title: &str) -> String {
    title.trim().to_uppercase()
}

const MECHANICS: [(&str, &str); 5] = [
    ("discard", "discard"),
    ("draw", "draw"),
    ("sheol", "sheol"),
    ("pages", "pages"),
    ("tower", "tower"),
];

const STATS: [&str; 3] = ["lore", "context", "complexity"];

/// Reduce ability text to its mechanics: sorted tags joined by `_`, e.g.
/// `discard_draw` or `conditional_opponent_stat_lore_type_noun`. Text that
/// names no known mechanic is `unique`; empty text yields an empty string.
pub fn ability_pattern(text: &str) -> String {
    let text = text.trim().to_lowercase();
    if text.is_empty() {
        return String::new();
    }
    let has = |needle: &str| text.contains(needle);

    let mut tags: Vec<String> = Vec::new();
    if has("look at") && has("top") {
        tags.push("look_top".to_string());
    }
    if has("add") && has("hand") {
        tags.push("add_hand".to_string());
    }
    for (needle, tag) in MECHANICS {
        if has(needle) {
            tags.push(tag.to_string());
        }
    }
    if let Some(card_type) = CardType::ALL
        .iter()
        .map(|t| t.as_str().to_lowercase())
        .find(|t| has(t.as_str()))
    {
        tags.push(format!("type_{}", card_type));
    }
    if let Some(stat) = STATS.iter().find(|s| has(**s)) {
        tags.push(format!("stat_{}", stat));
    }
    if has("when") || has("if") {
        tags.push("conditional".to_string());
    }
    if has("opponent") {
        tags.push("opponent".to_string());
    }
    if has("choose") || has("select") {
        tags.push("choice".to_string());
    }

    if tags.is_empty() {
        return "unique".to_string();
    }
    tags.sort();
    tags.join("_")
}

/// Error classification kept for operator visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Transient errors kept recurring until the attempt budget ran out.
    Exhausted,
    /// Malformed input or a deterministic phase that cannot succeed on retry.
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub phase: Phase,
    pub class: FailureClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Identifiers in the remote catalog. Written only by the sync protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLinkage {
    pub asset_id: Option<String>,
    /// Content hash of the artifact stored under `asset_id`.
    pub uploaded_hash: Option<String>,
    pub component_id: Option<String>,
    /// Content hash last wired into the remote deck.
    pub synced_hash: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
}

/// One card tracked through its full lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub seq: Seq,
    pub category: Category,
    pub phase: Phase,
    #[serde(default)]
    pub content: Option<CardContent>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub art_hash: Option<String>,
    #[serde(default)]
    pub composite_hash: Option<String>,
    #[serde(default)]
    pub grade: Option<GradeResult>,
    /// Number of times this item has gone around the rebuild edge.
    #[serde(default)]
    pub rebuilds: u32,
    /// Deficiencies from the last failed grade, carried into regeneration.
    #[serde(default)]
    pub rebuild_hints: Vec<Deficiency>,
    /// Times this item was found mid-phase after a crash.
    #[serde(default)]
    pub recoveries: u32,
    #[serde(default)]
    pub retry: RetryState,
    #[serde(default)]
    pub failure: Option<ItemFailure>,
    #[serde(default)]
    pub remote: RemoteLinkage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Item {
    pub fn new(seq: Seq, category: Category) -> Self {
        let now = Utc::now();
        Self {
            seq,
            category,
            phase: Phase::Pending,
            content: None,
            content_hash: None,
            art_hash: None,
            composite_hash: None,
            grade: None,
            rebuilds: 0,
            rebuild_hints: Vec::new(),
            recoveries: 0,
            retry: RetryState::default(),
            failure: None,
            remote: RemoteLinkage::default(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// True when the remote catalog does not reflect this item's current content.
    pub fn is_sync_dirty(&self) -> bool {
        if self.phase != Phase::Done {
            return false;
        }
        self.remote.asset_id.is_none() || self.remote.synced_hash != self.content_hash
    }

    /// True when an asset for the current content is already uploaded.
    pub fn has_current_upload(&self) -> bool {
        self.remote.asset_id.is_some()
            && self.content_hash.is_some()
            && self.remote.uploaded_hash == self.content_hash
    }

    pub fn title(&self) -> Option<&str> {
        self.content.as_ref().map(|c| c.title.as_str())
    }
}

/// Predicate over items for `Ledger::list`.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub phases: Option<Vec<Phase>>,
    pub card_type: Option<CardType>,
    pub rarity: Option<Rarity>,
}

impl ItemFilter {
    pub fn phase(phase: Phase) -> Self {
        Self {
            phases: Some(vec![phase]),
            ..Self::default()
        }
    }

    pub fn phases(phases: &[Phase]) -> Self {
        Self {
            phases: Some(phases.to_vec()),
            ..Self::default()
        }
    }

    pub fn with_rarity(mut self, rarity: Rarity) -> Self {
        self.rarity = Some(rarity);
        self
    }

    pub fn with_card_type(mut self, card_type: CardType) -> Self {
        self.card_type = Some(card_type);
        self
    }

    pub fn matches(&self, item: &Item) -> bool {
        if let Some(phases) = &self.phases {
            if !phases.contains(&item.phase) {
                return false;
            }
        }
        if let Some(t) = self.card_type {
            if item.category.card_type != t {
                return false;
            }
        }
        if let Some(r) = self.rarity {
            if item.category.rarity != r {
                return false;
            }
        }
        true
    }
}
