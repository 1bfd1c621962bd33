//! Match decisions and the classification state machine.
//!
//! Each incoming record is classified exactly once. The classifier is pure:
//! given the record's signals, the top-ranked candidate and (when relevant)
//! the resident count of the shared place, it always yields the same decision.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{HouseholdPolicy, Thresholds};
use crate::entity::EntityId;
use crate::error::SignalKind;
use crate::household::{HouseholdId, InferredFrom, PlaceId};
use crate::normalize::{NormalizedSignals, SignalIssue};
use crate::record::{RecordId, SourceSystem};
use crate::review::{ReviewItemId, ReviewResolution};
use crate::scoring::{ScoredCandidate, SignalScores};

/// Outcome of classifying one incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    /// Same person as the top candidate.
    AutoMatch,
    /// A person the store has never seen.
    NewEntity,
    /// Needs a human decision.
    ReviewPending,
    /// A distinct co-resident of the top candidate.
    HouseholdMember,
    /// Nothing usable to resolve.
    Rejected,
}

impl fmt::Display for DecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoMatch => write!(f, "auto_match"),
            Self::NewEntity => write!(f, "new_entity"),
            Self::ReviewPending => write!(f, "review_pending"),
            Self::HouseholdMember => write!(f, "household_member"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// The persisted record of how an incoming record was resolved.
///
/// Everything except the review fields is fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDecision {
    /// Identifier (shared with the review queue).
    pub decision_id: ReviewItemId,
    /// The record this decision resolved.
    pub incoming_record_ref: RecordId,
    /// Originating system of the record.
    pub source_system: SourceSystem,
    /// Classification.
    pub decision_type: DecisionType,
    /// Best-scoring candidate, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_candidate_entity_id: Option<EntityId>,
    /// Entity the record was attached to or created as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_entity_id: Option<EntityId>,
    /// Household the record joined, for `household_member`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub household_id: Option<HouseholdId>,
    /// Weighted composite of the top candidate.
    pub composite_score: f64,
    /// Breakdown of the composite.
    pub per_signal_scores: SignalScores,
    /// Signals that contributed a non-zero score.
    #[serde(default)]
    pub matched_on: Vec<SignalKind>,
    /// Malformed signals that were degraded to 0.
    #[serde(default)]
    pub signal_issues: Vec<SignalIssue>,
    /// Canonical signals of the record, kept so a reviewer's action can
    /// attach them later.
    #[serde(default)]
    pub signals: NormalizedSignals,
    /// Human-readable explanation.
    pub decision_reason: String,
    /// When the decision was made.
    pub processed_at: DateTime<Utc>,

    /// When a reviewer resolved the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Who resolved the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    /// Reviewer notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<String>,
    /// Terminal outcome of the review.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ReviewResolution>,
}

impl MatchDecision {
    /// Returns true while the decision waits in the review queue.
    #[must_use]
    pub fn is_pending_review(&self) -> bool {
        self.decision_type == DecisionType::ReviewPending && self.resolution.is_none()
    }

    /// Returns true once a reviewer (or a cascading merge) resolved it.
    #[must_use]
    pub const fn is_reviewed(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Resident information for the place a household override would use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HouseholdContext {
    /// The shared place.
    pub place: PlaceId,
    /// Distinct identities already living there.
    pub residents: usize,
}

/// Result of classification, before any effect is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Decision type.
    pub decision_type: DecisionType,
    /// Explanation stored on the decision.
    pub reason: String,
    /// Set for `household_member`: where and why.
    pub household: Option<(PlaceId, InferredFrom)>,
}

impl Classification {
    fn new(decision_type: DecisionType, reason: impl Into<String>) -> Self {
        Self {
            decision_type,
            reason: reason.into(),
            household: None,
        }
    }
}

/// Deterministic decision state machine.
///
/// Order of evaluation:
/// 1. no usable signal → `rejected`
/// 2. no candidate → `new_entity`
/// 3. household override → `household_member`
/// 4. `composite ≥ auto_match` → `auto_match`
/// 5. `composite ≥ review` → `review_pending`
/// 6. exact email below `review` → `review_pending` (if enabled)
/// 7. otherwise → `new_entity`
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    thresholds: Thresholds,
    household: HouseholdPolicy,
}

impl Classifier {
    /// Creates a classifier.
    #[must_use]
    pub const fn new(thresholds: Thresholds, household: HouseholdPolicy) -> Self {
        Self {
            thresholds,
            household,
        }
    }

    /// Which secondary identifiers the top candidate shares, if it shares
    /// only phone and/or address (no email, dissimilar name).
    ///
    /// Both sides must carry a name: without one, "different person" cannot
    /// be established and the thresholds decide.
    #[must_use]
    pub fn household_pattern(&self, signals: &NormalizedSignals, top: &ScoredCandidate) -> Option<InferredFrom> {
        if !self.household.enabled {
            return None;
        }
        if signals.name.is_none() || !top.entity.has_name() {
            return None;
        }
        let s = &top.scores;
        if s.email > 0.0 || s.name >= self.household.name_ceiling {
            return None;
        }
        InferredFrom::from_shared(s.phone >= 1.0, s.address >= 1.0)
    }

    /// Classifies a record.
    ///
    /// `context` is consulted only when the household pattern holds.
    #[must_use]
    pub fn classify(
        &self,
        signals: &NormalizedSignals,
        top: Option<&ScoredCandidate>,
        context: Option<&HouseholdContext>,
    ) -> Classification {
        if !signals.has_any() {
            return Classification::new(DecisionType::Rejected, "no usable signals");
        }

        let Some(top) = top else {
            return Classification::new(DecisionType::NewEntity, "no candidates found");
        };

        if let (Some(shared), Some(ctx)) = (self.household_pattern(signals, top), context) {
            if ctx.residents >= self.household.min_residents {
                return Classification {
                    decision_type: DecisionType::HouseholdMember,
                    reason: format!(
                        "{shared} with {} at a place with {} resident(s); names differ",
                        top.entity.entity_id, ctx.residents
                    ),
                    household: Some((ctx.place.clone(), shared)),
                };
            }
        }

        let composite = top.composite;
        let t = &self.thresholds;
        if composite >= t.auto_match {
            return Classification::new(
                DecisionType::AutoMatch,
                format!("composite {composite:.3} >= auto-match threshold {:.2}", t.auto_match),
            );
        }
        if composite >= t.review {
            return Classification::new(
                DecisionType::ReviewPending,
                format!("composite {composite:.3} within review band [{:.2}, {:.2})", t.review, t.auto_match),
            );
        }
        if t.review_on_exact_email && top.scores.email >= 1.0 {
            return Classification::new(
                DecisionType::ReviewPending,
                format!("exact email match with composite {composite:.3} below review threshold"),
            );
        }
        Classification::new(
            DecisionType::NewEntity,
            format!("composite {composite:.3} < review threshold {:.2}", t.review),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::ResolutionConfig;
    use crate::entity::CandidateEntity;
    use crate::normalize::normalize_name;

    fn classifier() -> Classifier {
        let c = ResolutionConfig::default();
        Classifier::new(c.thresholds, c.household)
    }

    fn scored(scores: SignalScores, name: &str) -> ScoredCandidate {
        ScoredCandidate {
            entity: CandidateEntity::new(name),
            composite: scores.composite(&ResolutionConfig::default().weights),
            scores,
        }
    }

    fn named(name: &str) -> NormalizedSignals {
        NormalizedSignals {
            name: normalize_name(name),
            ..NormalizedSignals::default()
        }
    }

    #[test]
    fn empty_signals_are_rejected() {
        let c = classifier().classify(&NormalizedSignals::default(), None, None);
        assert_eq!(c.decision_type, DecisionType::Rejected);
    }

    #[test]
    fn no_candidates_is_new_entity() {
        let c = classifier().classify(&named("Jane Doe"), None, None);
        assert_eq!(c.decision_type, DecisionType::NewEntity);
    }

    #[test]
    fn zero_scores_is_new_entity() {
        let top = scored(SignalScores::default(), "Other Person");
        let c = classifier().classify(&named("Jane Doe"), Some(&top), None);
        assert_eq!(c.decision_type, DecisionType::NewEntity);
    }

    #[test]
    fn all_signals_auto_match() {
        let top = scored(SignalScores::new(1.0, 1.0, 1.0, 1.0).unwrap(), "Jane Doe");
        let c = classifier().classify(&named("Jane Doe"), Some(&top), None);
        assert_eq!(c.decision_type, DecisionType::AutoMatch);
    }

    #[test]
    fn strong_partial_is_review_pending() {
        let top = scored(SignalScores::new(1.0, 1.0, 0.8, 0.0).unwrap(), "Jane Doe");
        let c = classifier().classify(&named("Jane Doe"), Some(&top), None);
        assert_eq!(c.decision_type, DecisionType::ReviewPending);
    }

    #[test]
    fn exact_email_only_is_review_pending() {
        let top = scored(SignalScores::new(1.0, 0.0, 0.0, 0.0).unwrap(), "Jane Doe");
        let signals = NormalizedSignals {
            email: Some("a@x.com".to_string()),
            ..NormalizedSignals::default()
        };
        let c = classifier().classify(&signals, Some(&top), None);
        assert_eq!(c.decision_type, DecisionType::ReviewPending);
        assert!((top.composite - 0.40).abs() < 1e-9);
    }

    #[test]
    fn exact_email_floor_can_be_disabled() {
        let mut config = ResolutionConfig::default();
        config.thresholds.review_on_exact_email = false;
        let classifier = Classifier::new(config.thresholds, config.household);
        let top = scored(SignalScores::new(1.0, 0.0, 0.0, 0.0).unwrap(), "Jane Doe");
        let signals = NormalizedSignals {
            email: Some("a@x.com".to_string()),
            ..NormalizedSignals::default()
        };
        let c = classifier.classify(&signals, Some(&top), None);
        assert_eq!(c.decision_type, DecisionType::NewEntity);
    }

    #[test]
    fn phone_only_never_auto_matches() {
        let top = scored(SignalScores::new(0.0, 1.0, 0.0, 0.0).unwrap(), "");
        let signals = NormalizedSignals {
            phone: Some("7075550134".to_string()),
            ..NormalizedSignals::default()
        };
        let c = classifier().classify(&signals, Some(&top), None);
        assert_ne!(c.decision_type, DecisionType::AutoMatch);
        assert_eq!(c.decision_type, DecisionType::NewEntity);
    }

    #[test]
    fn shared_phone_and_address_with_resident_is_household() {
        let top = scored(SignalScores::new(0.0, 1.0, 0.0, 1.0).unwrap(), "Robert Kowalski");
        let ctx = HouseholdContext {
            place: PlaceId::new("1 elm st"),
            residents: 1,
        };
        let c = classifier().classify(&named("Jane Doe"), Some(&top), Some(&ctx));
        assert_eq!(c.decision_type, DecisionType::HouseholdMember);
        assert_eq!(
            c.household,
            Some((PlaceId::new("1 elm st"), InferredFrom::SharedPhoneAndAddress))
        );
    }

    #[test]
    fn unnamed_candidate_is_not_a_co_resident() {
        let top = scored(SignalScores::new(0.0, 1.0, 0.0, 1.0).unwrap(), "");
        assert!(classifier().household_pattern(&named("Jane Doe"), &top).is_none());
    }

    #[test]
    fn household_requires_existing_resident() {
        let mut config = ResolutionConfig::default();
        config.household.min_residents = 2;
        let classifier = Classifier::new(config.thresholds, config.household);
        let top = scored(SignalScores::new(0.0, 1.0, 0.0, 1.0).unwrap(), "Robert Kowalski");
        let ctx = HouseholdContext {
            place: PlaceId::new("1 elm st"),
            residents: 1,
        };
        let c = classifier.classify(&named("Jane Doe"), Some(&top), Some(&ctx));
        assert_eq!(c.decision_type, DecisionType::NewEntity);
    }

    #[test]
    fn similar_name_blocks_household_override() {
        let top = scored(SignalScores::new(0.0, 1.0, 0.9, 1.0).unwrap(), "Jane Doe");
        let c = classifier();
        assert!(c.household_pattern(&named("Jane Dow"), &top).is_none());
    }

    #[test]
    fn shared_email_blocks_household_override() {
        let top = scored(SignalScores::new(1.0, 1.0, 0.0, 1.0).unwrap(), "Robert");
        assert!(classifier().household_pattern(&named("Jane"), &top).is_none());
    }

    #[test]
    fn decision_pending_flags() {
        let d = MatchDecision {
            decision_id: ReviewItemId::new(),
            incoming_record_ref: RecordId::new(),
            source_system: SourceSystem::Manual,
            decision_type: DecisionType::ReviewPending,
            top_candidate_entity_id: None,
            resolved_entity_id: None,
            household_id: None,
            composite_score: 0.6,
            per_signal_scores: SignalScores::default(),
            matched_on: Vec::new(),
            signal_issues: Vec::new(),
            signals: NormalizedSignals::default(),
            decision_reason: String::new(),
            processed_at: Utc::now(),
            reviewed_at: None,
            reviewed_by: None,
            review_notes: None,
            resolution: None,
        };
        assert!(d.is_pending_review());
        assert!(!d.is_reviewed());
    }
}
