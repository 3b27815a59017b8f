//! Quota-Aware Scheduling
//!
//! Chooses the category of the next card. Each axis (rarity, card type)
//! is balanced independently:
//!
//!   deficit(c) = target(c) * max(collection_size, total) - count(c)
//!
//! The largest positive deficit wins, ties go to declaration order. When
//! nothing is under target the axis falls back to round robin indexed by
//! the current total. Everything is derived from a ledger snapshot, so
//! rerunning after a crash gives a quota-respecting answer with no
//! counters to repair.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::{weight_total, QuotaConfig};
use crate::ledger::LedgerSnapshot;
use crate::model::{CardType, Category, Item, Phase, Rarity};

/// Quota weights for both axes, normalised on use.
#[derive(Debug, Clone)]
pub struct QuotaTargets {
    pub collection_size: u64,
    pub rarity: BTreeMap<Rarity, u32>,
    pub card_type: BTreeMap<CardType, u32>,
}

impl QuotaTargets {
    pub fn from_config(config: &QuotaConfig) -> Self {
        Self {
            collection_size: u64::from(config.collection_size),
            rarity: config.rarity.clone(),
            card_type: config.card_type.clone(),
        }
    }
}

/// One axis of a scheduling decision, kept for operator preview.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisChoice<K: Ord> {
    pub chosen: K,
    pub counts: BTreeMap<K, u64>,
    pub deficits: BTreeMap<K, f64>,
    /// True when no bucket was under target.
    pub round_robin: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleDecision {
    pub category: Category,
    /// Items counted toward quotas.
    pub total: u64,
    pub denominator: u64,
    pub rarity: AxisChoice<Rarity>,
    pub card_type: AxisChoice<CardType>,
}

pub struct Scheduler {
    targets: QuotaTargets,
}

impl Scheduler {
    pub fn new(targets: QuotaTargets) -> Self {
        Self { targets }
    }

    pub fn from_config(config: &QuotaConfig) -> Self {
        Self::new(QuotaTargets::from_config(config))
    }

    pub fn next_category(&self, snapshot: &LedgerSnapshot) -> Category {
        self.decide(snapshot).category
    }

    /// Full decision for the next card.
    pub fn decide(&self, snapshot: &LedgerSnapshot) -> ScheduleDecision {
        let counted: Vec<&Item> = snapshot.iter().filter(|i| counts_toward_quota(i)).collect();
        let total = counted.len() as u64;
        let denominator = total.max(self.targets.collection_size);

        let mut rarity_counts = BTreeMap::new();
        let mut type_counts = BTreeMap::new();
        for item in &counted {
            *rarity_counts.entry(item.category.rarity).or_insert(0) += 1;
            *type_counts.entry(item.category.card_type).or_insert(0) += 1;
        }

        let rarity = pick(&self.targets.rarity, rarity_counts, total, denominator)
            .unwrap_or_else(|| fallback(Rarity::Common));
        let card_type = pick(&self.targets.card_type, type_counts, total, denominator)
            .unwrap_or_else(|| fallback(CardType::Noun));

        ScheduleDecision {
            category: Category::new(card_type.chosen, rarity.chosen),
            total,
            denominator,
            rarity,
            card_type,
        }
    }
}

/// Failed items are out of the collection until requeued.
fn counts_toward_quota(item: &Item) -> bool {
    item.phase != Phase::Failed
}

fn fallback<K: Ord>(chosen: K) -> AxisChoice<K> {
    AxisChoice {
        chosen,
        counts: BTreeMap::new(),
        deficits: BTreeMap::new(),
        round_robin: true,
    }
}

/// `None` only when every weight is zero, which config validation rejects.
fn pick<K: Copy + Ord>(
    weights: &BTreeMap<K, u32>,
    counts: BTreeMap<K, u64>,
    total: u64,
    denominator: u64,
) -> Option<AxisChoice<K>> {
    let weight_sum = i128::from(weight_total(weights.values()));
    if weight_sum == 0 {
        return None;
    }

    // Scaled by weight_sum to stay in integers: deficit * weight_sum.
    let mut best: Option<(K, i128)> = None;
    let mut deficits = BTreeMap::new();
    for (&key, &weight) in weights {
        let count = counts.get(&key).copied().unwrap_or(0);
        let scaled = i128::from(weight) * i128::from(denominator) - i128::from(count) * weight_sum;
        deficits.insert(key, scaled as f64 / weight_sum as f64);
        if scaled > 0 && best.map_or(true, |(_, b)| scaled > b) {
            best = Some((key, scaled));
        }
    }

    let (chosen, round_robin) = match best {
        Some((key, _)) => (key, false),
        None => {
            let active: Vec<K> = weights
                .iter()
                .filter(|(_, w)| **w > 0)
                .map(|(&k, _)| k)
                .collect();
            (active[(total % active.len() as u64) as usize], true)
        }
    };

    Some(AxisChoice {
        chosen,
        counts,
        deficits,
        round_robin,
    })
}
