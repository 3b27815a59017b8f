//! Configuration management
//!
//! Loaded once from `cardforge.toml` and validated before anything runs.
//! Every section has defaults, so a missing file is a valid configuration.
//!
//! # Sections
//!
//! - **core**: state directory, templates directory, log level
//! - **worker**: worker pool parallelism
//! - **retry**: attempt budget and backoff schedule for collaborator calls
//! - **references**: reference set bound
//! - **quotas**: rarity and type targets plus the planned collection size
//! - **rubric**: category weights, pass threshold, critical violations
//! - **sync**: remote folder/deck names, batch size, card back

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::gate::{RubricCategory, ViolationKind};
use crate::model::{CardType, Rarity};

/// Upper bound on references accepted by the image collaborator.
pub const MAX_REFERENCES_LIMIT: usize = 14;

/// Remote catalog limit on entities per batched request.
pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeConfig {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub references: ReferenceConfig,
    #[serde(default)]
    pub quotas: QuotaConfig,
    #[serde(default)]
    pub rubric: RubricConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Ledger, catalog record and artifacts live here.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Card template definitions (`*.json`).
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,

    /// Template used when none is named per category.
    #[serde(default = "default_template_id")]
    pub default_template: String,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            templates_dir: default_templates_dir(),
            default_template: default_template_id(),
            log_level: default_log_level(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_template_id() -> String {
    "card-standard".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
        }
    }
}

fn default_parallelism() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceConfig {
    /// Total references per request, template included.
    #[serde(default = "default_max_references")]
    pub max_references: usize,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            max_references: default_max_references(),
        }
    }
}

fn default_max_references() -> usize {
    6
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Planned size of the finished collection. Deficits are measured
    /// against `max(collection_size, current total)`.
    #[serde(default = "default_collection_size")]
    pub collection_size: u32,
    /// Relative weights; converted to proportions of their sum.
    #[serde(default = "default_rarity_targets")]
    pub rarity: BTreeMap<Rarity, u32>,
    #[serde(default = "default_type_targets")]
    pub card_type: BTreeMap<CardType, u32>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            collection_size: default_collection_size(),
            rarity: default_rarity_targets(),
            card_type: default_type_targets(),
        }
    }
}

fn default_collection_size() -> u32 {
    100
}

fn default_rarity_targets() -> BTreeMap<Rarity, u32> {
    BTreeMap::from([
        (Rarity::Common, 40),
        (Rarity::Uncommon, 35),
        (Rarity::Rare, 15),
        (Rarity::Glorious, 10),
    ])
}

fn default_type_targets() -> BTreeMap<CardType, u32> {
    BTreeMap::from([
        (CardType::Noun, 16),
        (CardType::Verb, 20),
        (CardType::Adjective, 20),
        (CardType::Name, 16),
        (CardType::Title, 18),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricConfig {
    /// Category weights; must sum to 100.
    #[serde(default = "default_rubric_weights")]
    pub weights: BTreeMap<RubricCategory, u32>,
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: u32,
    /// Violations that fail the grade regardless of score.
    #[serde(default = "default_critical")]
    pub critical: BTreeSet<ViolationKind>,
    /// Categories scoring below this percentage produce a deficiency tag.
    #[serde(default = "default_category_floor")]
    pub category_floor: u8,
}

impl Default for RubricConfig {
    fn default() -> Self {
        Self {
            weights: default_rubric_weights(),
            pass_threshold: default_pass_threshold(),
            critical: default_critical(),
            category_floor: default_category_floor(),
        }
    }
}

fn default_rubric_weights() -> BTreeMap<RubricCategory, u32> {
    BTreeMap::from([
        (RubricCategory::Formatting, 35),
        (RubricCategory::TextClarity, 30),
        (RubricCategory::ArtQuality, 20),
        (RubricCategory::ContentAlignment, 15),
    ])
}

fn default_pass_threshold() -> u32 {
    90
}

fn default_critical() -> BTreeSet<ViolationKind> {
    BTreeSet::from([ViolationKind::StyleMismatch, ViolationKind::StructuralMismatch])
}

fn default_category_floor() -> u8 {
    90
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_folder_name")]
    pub folder_name: String,
    #[serde(default = "default_deck_name")]
    pub deck_name: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Deck back image, uploaded once.
    #[serde(default)]
    pub card_back: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            folder_name: default_folder_name(),
            deck_name: default_deck_name(),
            batch_size: default_batch_size(),
            card_back: None,
        }
    }
}

fn default_folder_name() -> String {
    "cardforge".to_string()
}

fn default_deck_name() -> String {
    "Main Deck".to_string()
}

fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}

impl ForgeConfig {
    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.parallelism == 0 {
            return Err(ConfigError::Invalid("worker.parallelism must be >= 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be >= 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if !(1..=MAX_REFERENCES_LIMIT).contains(&self.references.max_references) {
            return Err(ConfigError::Invalid(format!(
                "references.max_references must be in 1..={}",
                MAX_REFERENCES_LIMIT
            )));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.sync.batch_size) {
            return Err(ConfigError::Invalid(format!(
                "sync.batch_size must be in 1..={}",
                MAX_BATCH_SIZE
            )));
        }
        if weight_total(self.quotas.rarity.values()) == 0 {
            return Err(ConfigError::Invalid("quotas.rarity must have a positive weight".into()));
        }
        if weight_total(self.quotas.card_type.values()) == 0 {
            return Err(ConfigError::Invalid("quotas.card_type must have a positive weight".into()));
        }

        if let Some((category, weight)) = self.rubric.weights.iter().find(|(_, w)| **w > 100) {
            return Err(ConfigError::Invalid(format!(
                "rubric.weights.{} must be <= 100, got {}",
                category.as_str(),
                weight
            )));
        }
        let weight_sum = weight_total(self.rubric.weights.values());
        if weight_sum != 100 {
            return Err(ConfigError::Invalid(format!(
                "rubric.weights must sum to 100, got {}",
                weight_sum
            )));
        }
        if self.rubric.pass_threshold > 100 {
            return Err(ConfigError::Invalid("rubric.pass_threshold must be <= 100".into()));
        }
        if self.rubric.category_floor > 100 {
            return Err(ConfigError::Invalid("rubric.category_floor must be <= 100".into()));
        }
        Ok(())
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.core.state_dir.join("ledger")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.core.state_dir.join("artifacts")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.core.state_dir.join("catalog.json")
    }
}

/// Sum of user-supplied weights, widened so it cannot overflow.
pub(crate) fn weight_total<'a>(weights: impl Iterator<Item = &'a u32>) -> u64 {
    weights.map(|&w| u64::from(w)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ForgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.rubric.pass_threshold, 90);
        assert_eq!(config.quotas.rarity[&Rarity::Uncommon], 35);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = ForgeConfig::from_toml(
            r#"
            [worker]
            parallelism = 8

            [quotas.rarity]
            COMMON = 50
            RARE = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.worker.parallelism, 8);
        assert_eq!(config.quotas.rarity.len(), 2);
        assert_eq!(config.sync.batch_size, MAX_BATCH_SIZE);
    }

    #[test]
    fn test_rubric_weights_must_sum_to_100() {
        let err = ForgeConfig::from_toml(
            r#"
            [rubric.weights]
            formatting = 50
            text_clarity = 30
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("sum to 100"));
    }

    #[test]
    fn test_oversized_rubric_weight_is_rejected_not_wrapped() {
        // 4294967295 + 101 wraps to 100 in u32 arithmetic.
        let err = ForgeConfig::from_toml(
            r#"
            [rubric.weights]
            formatting = 4294967295
            text_clarity = 101
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must be <= 100"), "{}", err);
    }

    #[test]
    fn test_huge_quota_weights_do_not_overflow() {
        let config = ForgeConfig::from_toml(
            r#"
            [quotas.rarity]
            COMMON = 4294967295
            RARE = 4294967295
            "#,
        )
        .unwrap();
        assert_eq!(weight_total(config.quotas.rarity.values()), 2 * u64::from(u32::MAX));
    }

    #[test]
    fn test_reference_bound_enforced() {
        let mut config = ForgeConfig::default();
        config.references.max_references = 15;
        assert!(config.validate().is_err());
        config.references.max_references = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = ForgeConfig::load(Path::new("/nonexistent/cardforge.toml")).unwrap();
        assert_eq!(config.core.log_level, "info");
    }
}
