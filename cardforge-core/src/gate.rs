//! Quality Gate - Weighted Rubric with Critical Overrides
//!
//! The judge supplies raw per-category scores; the pass/fail decision is
//! made here and is deterministic given those scores.
//!
//! pass = total >= threshold AND no critical violation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::collaborators::JudgeScores;
use crate::config::RubricConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RubricCategory {
    /// Frame, badges, icon placement.
    Formatting,
    TextClarity,
    ArtQuality,
    /// Art and text fit the card's type and rarity.
    ContentAlignment,
}

impl RubricCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RubricCategory::Formatting => "formatting",
            RubricCategory::TextClarity => "text_clarity",
            RubricCategory::ArtQuality => "art_quality",
            RubricCategory::ContentAlignment => "content_alignment",
        }
    }
}

impl fmt::Display for RubricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Art style does not match the reference cards.
    StyleMismatch,
    /// Card frame or layout differs from the template.
    StructuralMismatch,
    IllegibleText,
    WrongRarityBadge,
    Other,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::StyleMismatch => "style_mismatch",
            ViolationKind::StructuralMismatch => "structural_mismatch",
            ViolationKind::IllegibleText => "illegible_text",
            ViolationKind::WrongRarityBadge => "wrong_rarity_badge",
            ViolationKind::Other => "other",
        }
    }
}

/// Why an item failed the gate. Forwarded to the collaborators on rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "tag")]
pub enum Deficiency {
    /// A rubric category scored below the floor.
    LowScore { category: RubricCategory, score: u8 },
    Violation {
        kind: ViolationKind,
        critical: bool,
        detail: String,
    },
    /// Free-text correction from the judge.
    Correction { text: String },
}

impl Deficiency {
    /// Short machine-readable label.
    pub fn tag(&self) -> String {
        match self {
            Deficiency::LowScore { category, .. } => format!("low_{}", category),
            Deficiency::Violation { kind, .. } => kind.as_str().to_string(),
            Deficiency::Correction { .. } => "correction".to_string(),
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Deficiency::Violation { critical: true, .. })
    }
}

impl fmt::Display for Deficiency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deficiency::LowScore { category, score } => {
                write!(f, "{} scored {}%", category, score)
            }
            Deficiency::Violation {
                kind,
                critical,
                detail,
            } => {
                let marker = if *critical { " (critical)" } else { "" };
                write!(f, "{}{}: {}", kind.as_str(), marker, detail)
            }
            Deficiency::Correction { text } => write!(f, "correction: {}", text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    pub weight: u32,
    /// Percent of the category achieved, 0..=100.
    pub percent: u8,
    /// Weighted points contributed to the total.
    pub points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeResult {
    /// Weighted total, 0..=100.
    pub score: u32,
    pub breakdown: BTreeMap<RubricCategory, CategoryScore>,
    pub deficiencies: Vec<Deficiency>,
    pub threshold: u32,
    pub pass: bool,
    pub graded_at: DateTime<Utc>,
}

impl GradeResult {
    pub fn critical_violations(&self) -> impl Iterator<Item = &Deficiency> {
        self.deficiencies.iter().filter(|d| d.is_critical())
    }

    pub fn tags(&self) -> Vec<String> {
        self.deficiencies.iter().map(Deficiency::tag).collect()
    }
}

/// Rubric policy, validated once at startup.
#[derive(Debug, Clone)]
pub struct QualityGate {
    weights: BTreeMap<RubricCategory, u32>,
    threshold: u32,
    critical: BTreeSet<ViolationKind>,
    category_floor: u8,
}

impl QualityGate {
    /// `config` must already have passed `ForgeConfig::validate`.
    pub fn new(config: &RubricConfig) -> Self {
        Self {
            weights: config.weights.clone(),
            threshold: config.pass_threshold,
            critical: config.critical.clone(),
            category_floor: config.category_floor,
        }
    }

    pub fn weights(&self) -> &BTreeMap<RubricCategory, u32> {
        &self.weights
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Apply weights, threshold and critical overrides to raw judge scores.
    ///
    /// A category the judge did not score counts as zero.
    pub fn evaluate(&self, scores: &JudgeScores) -> GradeResult {
        let mut breakdown = BTreeMap::new();
        let mut deficiencies = Vec::new();
        let mut total = 0.0;

        for (&category, &weight) in &self.weights {
            let percent = scores.categories.get(&category).copied().unwrap_or(0).min(100);
            let points = weight as f64 * percent as f64 / 100.0;
            total += points;
            if percent < self.category_floor {
                deficiencies.push(Deficiency::LowScore {
                    category,
                    score: percent,
                });
            }
            breakdown.insert(
                category,
                CategoryScore {
                    weight,
                    percent,
                    points,
                },
            );
        }

        for violation in &scores.violations {
            deficiencies.push(Deficiency::Violation {
                kind: violation.kind,
                critical: self.critical.contains(&violation.kind),
                detail: violation.detail.clone(),
            });
        }
        for text in &scores.corrections {
            deficiencies.push(Deficiency::Correction { text: text.clone() });
        }

        let score = total.round().clamp(0.0, 100.0) as u32;
        let has_critical = deficiencies.iter().any(Deficiency::is_critical);
        let pass = score >= self.threshold && !has_critical;

        GradeResult {
            score,
            breakdown,
            deficiencies,
            threshold: self.threshold,
            pass,
            graded_at: Utc::now(),
        }
    }
}
