//! Per-signal similarity and weighted composite scoring.
//!
//! Every signal scores in [0, 1]: 1.0 for an exact normalized match, partial
//! credit for fuzzy name and address matches, and 0 when the signal is absent
//! on either side. The composite is the weighted sum, so a single present
//! signal can never exceed its own weight.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::SignalWeights;
use crate::entity::CandidateEntity;
use crate::error::{SignalKind, ValidationError};
use crate::normalize::NormalizedSignals;

const ADDRESS_PARTIAL_CAP: f64 = 0.5;

/// Per-signal similarity breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalScores {
    /// Email similarity.
    pub email: f64,
    /// Phone similarity.
    pub phone: f64,
    /// Name similarity.
    pub name: f64,
    /// Address similarity.
    pub address: f64,
}

impl SignalScores {
    /// Validated constructor.
    ///
    /// # Errors
    /// Returns `ValidationError::ScoreOutOfRange` if any score is outside [0, 1].
    pub fn new(email: f64, phone: f64, name: f64, address: f64) -> Result<Self, ValidationError> {
        for value in [email, phone, name, address] {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                return Err(ValidationError::ScoreOutOfRange { value });
            }
        }
        Ok(Self {
            email,
            phone,
            name,
            address,
        })
    }

    /// Weighted composite, rounded to 9 decimal places and clamped to [0, 1].
    ///
    /// # Examples
    ///
    /// ```
    /// use contact_resolver::{SignalScores, SignalWeights};
    ///
    /// let scores = SignalScores::new(1.0, 1.0, 0.8, 0.0).unwrap();
    /// assert!((scores.composite(&SignalWeights::default()) - 0.85).abs() < 1e-9);
    /// ```
    #[must_use]
    pub fn composite(&self, weights: &SignalWeights) -> f64 {
        let raw = weights.email * self.email
            + weights.phone * self.phone
            + weights.name * self.name
            + weights.address * self.address;
        ((raw * 1e9).round() / 1e9).clamp(0.0, 1.0)
    }

    /// Score for one signal.
    #[must_use]
    pub const fn get(&self, signal: SignalKind) -> f64 {
        match signal {
            SignalKind::Email => self.email,
            SignalKind::Phone => self.phone,
            SignalKind::Name => self.name,
            SignalKind::Address => self.address,
        }
    }

    /// Signals that contributed a non-zero score.
    #[must_use]
    pub fn matched_on(&self) -> Vec<SignalKind> {
        [
            SignalKind::Email,
            SignalKind::Phone,
            SignalKind::Name,
            SignalKind::Address,
        ]
        .into_iter()
        .filter(|s| self.get(*s) > 0.0)
        .collect()
    }
}

/// A candidate together with its score breakdown.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    /// The candidate entity.
    pub entity: CandidateEntity,
    /// Per-signal scores.
    pub scores: SignalScores,
    /// Weighted composite.
    pub composite: f64,
}

/// Similarity of two name comparison keys.
///
/// Takes the better of plain and token-sorted normalized Levenshtein
/// similarity, so "smith john" and "john smith" score 1.0.
#[must_use]
pub fn name_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let plain = strsim::normalized_levenshtein(a, b);
    let sorted = strsim::normalized_levenshtein(&sorted_tokens(a), &sorted_tokens(b));
    plain.max(sorted).clamp(0.0, 1.0)
}

fn sorted_tokens(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Similarity of two canonical addresses.
///
/// Identical addresses score 1.0; otherwise token overlap earns at most half
/// credit, since "12 elm st" and "14 elm st" are different places.
#[must_use]
pub fn address_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let ta: HashSet<&str> = a.split_whitespace().collect();
    let tb: HashSet<&str> = b.split_whitespace().collect();
    let union = ta.union(&tb).count();
    if union == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let jaccard = ta.intersection(&tb).count() as f64 / union as f64;
    jaccard * ADDRESS_PARTIAL_CAP
}

/// Scores candidates against a record's normalized signals.
#[derive(Debug, Clone, Copy)]
pub struct Scorer {
    weights: SignalWeights,
    name_floor: f64,
}

impl Scorer {
    /// Creates a scorer with the given weights and fuzzy-name floor.
    #[must_use]
    pub const fn new(weights: SignalWeights, name_floor: f64) -> Self {
        Self {
            weights,
            name_floor,
        }
    }

    /// The weights in use.
    #[must_use]
    pub const fn weights(&self) -> &SignalWeights {
        &self.weights
    }

    /// Per-signal scores for one candidate.
    #[must_use]
    pub fn signal_scores(&self, signals: &NormalizedSignals, candidate: &CandidateEntity) -> SignalScores {
        let email = match &signals.email {
            Some(e) if candidate.emails.iter().any(|c| c == e) => 1.0,
            _ => 0.0,
        };
        let phone = match &signals.phone {
            Some(p) if candidate.phones.iter().any(|c| c == p) => 1.0,
            _ => 0.0,
        };
        let name = match (&signals.name, candidate.name_key()) {
            (Some(n), Some(key)) => {
                let sim = name_similarity(&n.key, &key);
                if sim < self.name_floor {
                    0.0
                } else {
                    sim
                }
            }
            _ => 0.0,
        };
        let address = match (&signals.address, &candidate.address) {
            (Some(a), Some(b)) => address_similarity(a, b),
            _ => 0.0,
        };
        SignalScores {
            email,
            phone,
            name,
            address,
        }
    }

    /// Scores one candidate.
    #[must_use]
    pub fn score(&self, signals: &NormalizedSignals, candidate: CandidateEntity) -> ScoredCandidate {
        let scores = self.signal_scores(signals, &candidate);
        ScoredCandidate {
            composite: scores.composite(&self.weights),
            entity: candidate,
            scores,
        }
    }

    /// Scores and orders candidates, best first.
    ///
    /// Ties on the composite go to the most recently active candidate, then
    /// to the smaller entity id, so the order never depends on lookup order.
    #[must_use]
    pub fn rank(&self, signals: &NormalizedSignals, candidates: Vec<CandidateEntity>) -> Vec<ScoredCandidate> {
        let mut scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .map(|c| self.score(signals, c))
            .collect();
        scored.sort_by(compare_ranked);
        scored
    }
}

fn compare_ranked(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.composite
        .total_cmp(&a.composite)
        .then_with(|| b.entity.last_seen_at.cmp(&a.entity.last_seen_at))
        .then_with(|| a.entity.entity_id.cmp(&b.entity.entity_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, Utc};

    use crate::normalize::normalize_name;

    fn scorer() -> Scorer {
        Scorer::new(SignalWeights::default(), 0.5)
    }

    fn signals() -> NormalizedSignals {
        NormalizedSignals {
            email: Some("a@x.com".to_string()),
            phone: Some("7075550134".to_string()),
            name: normalize_name("Jane Doe"),
            address: Some("1 elm st".to_string()),
            issues: Vec::new(),
        }
    }

    #[test]
    fn all_signals_exact_scores_one() {
        let c = CandidateEntity::new("Jane Doe")
            .with_email("a@x.com")
            .with_phone("7075550134")
            .with_address("1 elm st");
        let s = scorer().score(&signals(), c);
        assert!((s.composite - 1.0).abs() < 1e-9);
        assert_eq!(s.scores.matched_on().len(), 4);
    }

    #[test]
    fn email_only_caps_at_email_weight() {
        let c = CandidateEntity::new("Someone Else").with_email("a@x.com");
        let only_email = NormalizedSignals {
            email: Some("a@x.com".to_string()),
            ..NormalizedSignals::default()
        };
        let s = scorer().score(&only_email, c);
        assert!((s.scores.email - 1.0).abs() < f64::EPSILON);
        assert!((s.composite - 0.40).abs() < 1e-9);
    }

    #[test]
    fn phone_only_caps_at_phone_weight() {
        let c = CandidateEntity::new("Other").with_phone("7075550134");
        let only_phone = NormalizedSignals {
            phone: Some("7075550134".to_string()),
            ..NormalizedSignals::default()
        };
        let s = scorer().score(&only_phone, c);
        assert!((s.composite - 0.25).abs() < 1e-9);
    }

    #[test]
    fn scenario_email_phone_and_partial_name() {
        let scores = SignalScores::new(1.0, 1.0, 0.8, 0.0).unwrap();
        assert!((scores.composite(&SignalWeights::default()) - 0.85).abs() < 1e-9);
    }

    #[test]
    fn absent_signal_on_either_side_scores_zero() {
        let c = CandidateEntity::new("Jane Doe");
        let s = scorer().score(&signals(), c);
        assert!(s.scores.email.abs() < f64::EPSILON);
        assert!(s.scores.phone.abs() < f64::EPSILON);
        assert!(s.scores.address.abs() < f64::EPSILON);
        assert!((s.scores.name - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unnamed_entity_earns_no_name_credit() {
        let c = CandidateEntity::new("").with_email("jane@xcom.org");
        let name_only = NormalizedSignals {
            name: normalize_name("Jane Xcom Org"),
            ..NormalizedSignals::default()
        };
        let s = scorer().score(&name_only, c);
        assert!(s.scores.name.abs() < f64::EPSILON);
        assert!(s.composite.abs() < f64::EPSILON);
    }

    #[test]
    fn name_similarity_handles_order_and_typos() {
        assert!((name_similarity("smith john", "john smith") - 1.0).abs() < f64::EPSILON);
        let typo = name_similarity("jane doe", "jane dow");
        assert!(typo > 0.8 && typo < 1.0);
        assert!(name_similarity("jane doe", "") < f64::EPSILON);
    }

    #[test]
    fn dissimilar_names_fall_below_floor() {
        let c = CandidateEntity::new("Robert Kowalski");
        let s = scorer().score(&signals(), c);
        assert!(s.scores.name.abs() < f64::EPSILON);
    }

    #[test]
    fn address_partial_credit_is_capped() {
        let sim = address_similarity("12 elm st", "14 elm st");
        assert!(sim > 0.0 && sim <= 0.5);
        assert!((address_similarity("1 elm st", "1 elm st") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rank_breaks_ties_by_recency_then_id() {
        let mut older = CandidateEntity::new("X").with_email("a@x.com");
        older.last_seen_at = Utc::now() - Duration::days(10);
        let newer = CandidateEntity::new("Y").with_email("a@x.com");
        let only_email = NormalizedSignals {
            email: Some("a@x.com".to_string()),
            ..NormalizedSignals::default()
        };
        let ranked = scorer().rank(&only_email, vec![older.clone(), newer.clone()]);
        assert_eq!(ranked[0].entity.entity_id, newer.entity_id);

        let ranked_again = scorer().rank(&only_email, vec![newer.clone(), older]);
        assert_eq!(ranked_again[0].entity.entity_id, newer.entity_id);
    }

    #[test]
    fn signal_scores_reject_out_of_range() {
        assert!(SignalScores::new(1.1, 0.0, 0.0, 0.0).is_err());
        assert!(SignalScores::new(f64::NAN, 0.0, 0.0, 0.0).is_err());
    }
}
