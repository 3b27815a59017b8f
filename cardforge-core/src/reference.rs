//! Reference Selection - Style Exemplars for Generation
//!
//! The template is always the first reference. The remaining slots go to
//! finished cards ranked by how closely their category matches the target:
//! rarity match outranks type match, and ties go to the most recently
//! completed card so the exemplars follow the current art style.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::path::{Path, PathBuf};

use crate::artifacts::ArtifactStore;
use crate::ledger::LedgerSnapshot;
use crate::model::{Category, Item, Phase, Rarity, Seq};

/// How an exemplar relates to the target category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    RarityOnly,
    TypeOnly,
    Fallback,
}

impl MatchKind {
    fn between(target: &Category, candidate: &Category) -> Self {
        match (
            target.rarity == candidate.rarity,
            target.card_type == candidate.card_type,
        ) {
            (true, true) => MatchKind::Exact,
            (true, false) => MatchKind::RarityOnly,
            (false, true) => MatchKind::TypeOnly,
            (false, false) => MatchKind::Fallback,
        }
    }

    /// Rarity is worth more than any type match.
    fn score(self) -> u8 {
        match self {
            MatchKind::Exact => 3,
            MatchKind::RarityOnly => 2,
            MatchKind::TypeOnly => 1,
            MatchKind::Fallback => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role")]
pub enum ReferenceRole {
    /// Structural layout exemplar.
    Template,
    Exemplar { matched: MatchKind },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    /// `None` for the template.
    pub seq: Option<Seq>,
    pub role: ReferenceRole,
    /// Rarity of the exemplar, so the collaborator can point at the right badge.
    pub rarity: Option<Rarity>,
    pub path: PathBuf,
}

impl ReferenceEntry {
    /// Human-readable role label sent alongside the image.
    pub fn label(&self) -> String {
        match (&self.role, self.rarity) {
            (ReferenceRole::Template, _) => "TEMPLATE: layout and frame".to_string(),
            (ReferenceRole::Exemplar { .. }, Some(rarity)) => format!("EXAMPLE: {} rarity", rarity),
            (ReferenceRole::Exemplar { .. }, None) => "EXAMPLE".to_string(),
        }
    }
}

/// Ordered references for one generation attempt. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSet {
    pub entries: Vec<ReferenceEntry>,
}

impl ReferenceSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn template(&self) -> Option<&ReferenceEntry> {
        self.entries
            .first()
            .filter(|e| e.role == ReferenceRole::Template)
    }

    pub fn exemplars(&self) -> impl Iterator<Item = &ReferenceEntry> {
        self.entries
            .iter()
            .filter(|e| e.role != ReferenceRole::Template)
    }
}

pub struct ReferenceSelector {
    max_references: usize,
}

impl ReferenceSelector {
    /// `max_references` counts the template; it is clamped to at least 1.
    pub fn new(max_references: usize) -> Self {
        Self {
            max_references: max_references.max(1),
        }
    }

    pub fn max_references(&self) -> usize {
        self.max_references
    }

    /// Pick references for `target`. Never fails: an empty ledger yields a
    /// template-only set.
    pub fn select(
        &self,
        target: &Category,
        exclude: Option<Seq>,
        snapshot: &LedgerSnapshot,
        template_path: &Path,
        artifacts: &ArtifactStore,
    ) -> ReferenceSet {
        let mut candidates: Vec<(&Item, MatchKind)> = snapshot
            .iter()
            .filter(|item| item.phase == Phase::Done && Some(item.seq) != exclude)
            .map(|item| (item, MatchKind::between(target, &item.category)))
            .collect();

        candidates.sort_by_key(|(item, matched)| {
            (
                Reverse(matched.score()),
                Reverse(completed_at(item)),
                Reverse(item.seq),
            )
        });

        let mut entries = Vec::with_capacity(self.max_references);
        entries.push(ReferenceEntry {
            seq: None,
            role: ReferenceRole::Template,
            rarity: None,
            path: template_path.to_path_buf(),
        });
        entries.extend(
            candidates
                .into_iter()
                .take(self.max_references - 1)
                .map(|(item, matched)| ReferenceEntry {
                    seq: Some(item.seq),
                    role: ReferenceRole::Exemplar { matched },
                    rarity: Some(item.category.rarity),
                    path: artifacts.composite_path(item.seq),
                }),
        );
        ReferenceSet { entries }
    }
}

fn completed_at(item: &Item) -> DateTime<Utc> {
    item.completed_at.unwrap_or(item.updated_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CardType;
    use chrono::Duration;

    fn done(seq: Seq, card_type: CardType, rarity: Rarity, minutes_ago: i64) -> Item {
        let mut item = Item::new(seq, Category::new(card_type, rarity));
        item.phase = Phase::Done;
        item.completed_at = Some(Utc::now() - Duration::minutes(minutes_ago));
        item
    }

    fn select(k: usize, target: Category, items: Vec<Item>) -> ReferenceSet {
        ReferenceSelector::new(k).select(
            &target,
            None,
            &LedgerSnapshot { items },
            Path::new("templates/card_standard.png"),
            &ArtifactStore::new("artifacts"),
        )
    }

    fn seqs(set: &ReferenceSet) -> Vec<Option<Seq>> {
        set.entries.iter().map(|e| e.seq).collect()
    }

    #[test]
    fn test_empty_ledger_is_template_only() {
        for rarity in Rarity::ALL {
            for card_type in CardType::ALL {
                let set = select(6, Category::new(card_type, rarity), vec![]);
                assert_eq!(set.len(), 1);
                assert!(set.template().is_some());
            }
        }
    }

    #[test]
    fn test_rarity_match_beats_type_match() {
        let target = Category::new(CardType::Noun, Rarity::Rare);
        let items = vec![
            done(1, CardType::Noun, Rarity::Common, 1),
            done(2, CardType::Verb, Rarity::Rare, 50),
            done(3, CardType::Noun, Rarity::Rare, 90),
            done(4, CardType::Title, Rarity::Glorious, 0),
        ];
        let set = select(6, target, items);
        assert_eq!(seqs(&set), vec![None, Some(3), Some(2), Some(1), Some(4)]);
        assert_eq!(
            set.entries[1].role,
            ReferenceRole::Exemplar {
                matched: MatchKind::Exact
            }
        );
        assert_eq!(set.entries[4].rarity, Some(Rarity::Glorious));
    }

    #[test]
    fn test_recency_breaks_ties() {
        let target = Category::new(CardType::Verb, Rarity::Common);
        let items = vec![
            done(1, CardType::Verb, Rarity::Common, 30),
            done(2, CardType::Verb, Rarity::Common, 5),
            done(3, CardType::Verb, Rarity::Common, 60),
        ];
        assert_eq!(seqs(&select(6, target, items)), vec![None, Some(2), Some(1), Some(3)]);
    }

    #[test]
    fn test_bounded_by_k_including_template() {
        let target = Category::new(CardType::Verb, Rarity::Common);
        let items = (1..=20)
            .map(|seq| done(seq, CardType::Verb, Rarity::Common, seq as i64))
            .collect();
        let set = select(4, target, items);
        assert_eq!(set.len(), 4);
        assert_eq!(set.exemplars().count(), 3);
    }

    #[test]
    fn test_only_done_items_and_not_self() {
        let target = Category::new(CardType::Verb, Rarity::Common);
        let mut pending = done(2, CardType::Verb, Rarity::Common, 1);
        pending.phase = Phase::Grading;
        let snapshot = LedgerSnapshot {
            items: vec![done(1, CardType::Verb, Rarity::Common, 1), pending, done(3, CardType::Verb, Rarity::Common, 2)],
        };
        let set = ReferenceSelector::new(6).select(
            &target,
            Some(3),
            &snapshot,
            Path::new("t.png"),
            &ArtifactStore::new("a"),
        );
        assert_eq!(seqs(&set), vec![None, Some(1)]);
    }

    #[test]
    fn test_labels_carry_rarity() {
        let target = Category::new(CardType::Verb, Rarity::Common);
        let set = select(6, target, vec![done(1, CardType::Noun, Rarity::Rare, 1)]);
        assert_eq!(set.entries[0].label(), "TEMPLATE: layout and frame");
        assert_eq!(set.entries[1].label(), "EXAMPLE: RARE rarity");
    }
}
