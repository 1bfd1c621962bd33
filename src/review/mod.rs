//! Review queue items, actions and filters.
//!
//! The queue holds two kinds of items: match decisions that landed in the
//! review band and dedup candidates found by the tiered scanner. Both share
//! one identifier space and one terminal-state discipline: an item resolves
//! exactly once and is never reopened.

mod queue;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decision::{DecisionType, MatchDecision};
use crate::dedup::{DedupCandidate, MatchTier};
use crate::entity::EntityId;
use crate::error::ValidationError;
use crate::record::SourceSystem;

pub use queue::ReviewQueue;

/// Identifier shared by decisions and dedup candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReviewItemId(Uuid);

impl ReviewItemId {
    /// Creates a new random ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ReviewItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReviewItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReviewItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// What a reviewer decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ReviewAction {
    /// Same person: merge candidate into canonical.
    Merge,
    /// Distinct people; the decision stands as a new entity.
    Approve,
    /// Distinct people; never pair them again.
    KeepSeparate,
    /// Source data untrustworthy; close without changes.
    Dismiss,
    /// Same as dismiss.
    Reject,
}

impl ReviewAction {
    /// Returns true for actions that confirm the two sides are distinct.
    #[must_use]
    pub const fn confirms_distinct(self) -> bool {
        matches!(self, Self::Approve | Self::KeepSeparate)
    }

    /// Returns true for actions that close the item with no entity changes.
    #[must_use]
    pub const fn discards(self) -> bool {
        matches!(self, Self::Dismiss | Self::Reject)
    }
}

impl fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge => write!(f, "merge"),
            Self::Approve => write!(f, "approve"),
            Self::KeepSeparate => write!(f, "keep_separate"),
            Self::Dismiss => write!(f, "dismiss"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

impl FromStr for ReviewAction {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "merge" => Ok(Self::Merge),
            "approve" => Ok(Self::Approve),
            "keep_separate" => Ok(Self::KeepSeparate),
            "dismiss" => Ok(Self::Dismiss),
            "reject" => Ok(Self::Reject),
            other => Err(ValidationError::UnsupportedAction {
                action: other.to_string(),
                kind: "any".to_string(),
            }),
        }
    }
}

impl TryFrom<String> for ReviewAction {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ReviewAction> for String {
    fn from(value: ReviewAction) -> Self {
        value.to_string()
    }
}

/// Terminal outcome recorded on a review item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewResolution {
    /// The two sides were merged (or the record attached to its candidate).
    Merged,
    /// The two sides were confirmed distinct.
    KeptSeparate,
    /// Dismissed as untrustworthy.
    Rejected,
    /// Closed because a merge on another item made it moot.
    Superseded,
}

impl ReviewResolution {
    /// Resolution recorded for a reviewer action.
    #[must_use]
    pub const fn for_action(action: ReviewAction) -> Self {
        match action {
            ReviewAction::Merge => Self::Merged,
            ReviewAction::Approve | ReviewAction::KeepSeparate => Self::KeptSeparate,
            ReviewAction::Dismiss | ReviewAction::Reject => Self::Rejected,
        }
    }
}

/// Lifecycle status of a review item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Waiting for a reviewer.
    #[default]
    Pending,
    /// Terminal.
    Resolved,
}

/// Kind of review item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    /// A `review_pending` match decision.
    Decision,
    /// A dedup candidate pair.
    Duplicate,
}

impl fmt::Display for ReviewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decision => write!(f, "decision"),
            Self::Duplicate => write!(f, "duplicate"),
        }
    }
}

/// Everything a terminal transition writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    /// Terminal resolution.
    pub resolution: ReviewResolution,
    /// Reviewer identity.
    pub reviewed_by: String,
    /// Reviewer notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<String>,
    /// Time of the transition.
    pub reviewed_at: DateTime<Utc>,
    /// Entity a decision item ended up attached to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_entity_id: Option<EntityId>,
}

impl ReviewOutcome {
    /// Creates an outcome stamped with the current time.
    #[must_use]
    pub fn new(resolution: ReviewResolution, reviewed_by: impl Into<String>, notes: Option<String>) -> Self {
        Self {
            resolution,
            reviewed_by: reviewed_by.into(),
            review_notes: notes,
            reviewed_at: Utc::now(),
            resolved_entity_id: None,
        }
    }

    /// Sets the entity a decision item resolved to.
    #[must_use]
    pub const fn with_entity(mut self, entity: EntityId) -> Self {
        self.resolved_entity_id = Some(entity);
        self
    }
}

/// One item in the review queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReviewItem {
    /// A decision waiting for confirmation.
    Decision(MatchDecision),
    /// A suspected duplicate pair.
    Duplicate(DedupCandidate),
}

impl ReviewItem {
    /// Item identifier.
    #[must_use]
    pub const fn id(&self) -> ReviewItemId {
        match self {
            Self::Decision(d) => d.decision_id,
            Self::Duplicate(c) => c.duplicate_id,
        }
    }

    /// Item kind.
    #[must_use]
    pub const fn kind(&self) -> ReviewKind {
        match self {
            Self::Decision(_) => ReviewKind::Decision,
            Self::Duplicate(_) => ReviewKind::Duplicate,
        }
    }

    /// Dedup tier (duplicates only).
    #[must_use]
    pub const fn tier(&self) -> Option<MatchTier> {
        match self {
            Self::Decision(_) => None,
            Self::Duplicate(c) => Some(c.match_tier),
        }
    }

    /// Composite or similarity score.
    #[must_use]
    pub const fn score(&self) -> f64 {
        match self {
            Self::Decision(d) => d.composite_score,
            Self::Duplicate(c) => c.similarity_score,
        }
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> ReviewStatus {
        match self {
            Self::Decision(d) if d.resolution.is_none() => ReviewStatus::Pending,
            Self::Decision(_) => ReviewStatus::Resolved,
            Self::Duplicate(c) => c.status,
        }
    }

    /// Returns true while the item awaits a reviewer.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status() == ReviewStatus::Pending
    }

    /// Terminal resolution, if resolved.
    #[must_use]
    pub const fn resolution(&self) -> Option<ReviewResolution> {
        match self {
            Self::Decision(d) => d.resolution,
            Self::Duplicate(c) => c.resolution,
        }
    }

    /// Returns true if the item points at `entity`.
    #[must_use]
    pub fn references(&self, entity: EntityId) -> bool {
        match self {
            Self::Decision(d) => d.top_candidate_entity_id == Some(entity),
            Self::Duplicate(c) => c.canonical_entity_id == entity || c.candidate_entity_id == entity,
        }
    }

    /// Key used in `ReviewPage::counts_by_tier_and_type`.
    #[must_use]
    pub fn bucket(&self) -> String {
        match self {
            Self::Decision(d) => d.decision_type.to_string(),
            Self::Duplicate(c) => format!("tier_{}", c.match_tier.number()),
        }
    }
}

/// Query over the review queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewFilter {
    /// Only this kind.
    pub kind: Option<ReviewKind>,
    /// Only duplicates of this tier.
    pub tier: Option<MatchTier>,
    /// Only decisions of this type.
    pub decision_type: Option<DecisionType>,
    /// Only decisions from this source system.
    pub source_system: Option<SourceSystem>,
    /// Status to list (defaults to pending).
    pub status: ReviewStatus,
}

impl ReviewFilter {
    /// Pending items of every kind.
    #[must_use]
    pub fn pending() -> Self {
        Self::default()
    }

    /// Restricts to one kind.
    #[must_use]
    pub const fn kind(mut self, kind: ReviewKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Restricts to one tier.
    #[must_use]
    pub const fn tier(mut self, tier: MatchTier) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Restricts to one status.
    #[must_use]
    pub const fn status(mut self, status: ReviewStatus) -> Self {
        self.status = status;
        self
    }

    /// Restricts to one source system.
    #[must_use]
    pub fn source_system(mut self, source: SourceSystem) -> Self {
        self.source_system = Some(source);
        self
    }

    /// Returns true if `item` passes every set criterion.
    #[must_use]
    pub fn matches(&self, item: &ReviewItem) -> bool {
        if item.status() != self.status {
            return false;
        }
        if self.kind.is_some_and(|k| k != item.kind()) {
            return false;
        }
        if let Some(tier) = self.tier {
            if item.tier() != Some(tier) {
                return false;
            }
        }
        match item {
            ReviewItem::Decision(d) => {
                self.decision_type.map_or(true, |t| t == d.decision_type)
                    && self.source_system.as_ref().map_or(true, |s| *s == d.source_system)
            }
            ReviewItem::Duplicate(_) => self.decision_type.is_none() && self.source_system.is_none(),
        }
    }
}

/// One page of review items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewPage {
    /// Items on this page.
    pub items: Vec<ReviewItem>,
    /// Number of matching items before paging.
    pub total: usize,
    /// Matching items per tier (`tier_N`) or decision type, before paging.
    pub counts_by_tier_and_type: BTreeMap<String, usize>,
}

/// Per-id failure in a batch resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    /// Item that failed.
    pub id: ReviewItemId,
    /// Error message.
    pub error: String,
    /// Whether retrying might succeed.
    pub retryable: bool,
}

/// Result of a batch resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Items resolved.
    pub succeeded: usize,
    /// Items that failed.
    pub failed: usize,
    /// Details for each failure.
    pub failures: Vec<BatchFailure>,
}
