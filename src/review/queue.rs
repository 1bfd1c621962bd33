//! Review actions over the queue.
//!
//! Every action locks the live entities behind its item before re-checking
//! that the item is still pending, so two reviewers acting on one item, or
//! on items sharing an entity, are serialized.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::decision::MatchDecision;
use crate::dedup::DedupCandidate;
use crate::entity::{EntityId, EntityPair};
use crate::error::{ResolutionError, ResolverError, ResolverResult, ValidationError};
use crate::resolver::{attach_evidence, create_entity, Resolver};
use crate::review::{
    BatchFailure, BatchOutcome, ReviewAction, ReviewFilter, ReviewItem, ReviewItemId, ReviewOutcome, ReviewPage,
    ReviewResolution,
};
use crate::storage::{EditLock, EntityStore, ReviewStore, StorageError};

const MAX_LOCK_ATTEMPTS: usize = 3;

/// Sort rank for queue ordering: tiers 1..=5, then decisions.
fn rank(item: &ReviewItem) -> u8 {
    item.tier().map_or(u8::MAX, |t| t.number())
}

/// Human review over pending decisions and dedup candidates.
///
/// Every action ends in exactly one terminal transition, enforced by the
/// store's compare-and-set. Entity edits happen under the item's edit lock
/// and before the transition; a failed edit leaves the item pending.
pub struct ReviewQueue {
    entities: Arc<dyn EntityStore>,
    reviews: Arc<dyn ReviewStore>,
    lock_timeout: Duration,
}

impl fmt::Debug for ReviewQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReviewQueue")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl ReviewQueue {
    /// Creates a queue over the given stores.
    #[must_use]
    pub fn new(entities: Arc<dyn EntityStore>, reviews: Arc<dyn ReviewStore>, lock_timeout: Duration) -> Self {
        Self {
            entities,
            reviews,
            lock_timeout,
        }
    }

    /// Creates a queue sharing a resolver's stores and lock timeout.
    #[must_use]
    pub fn for_resolver(resolver: &Resolver) -> Self {
        Self::new(
            resolver.entities(),
            resolver.reviews(),
            Duration::from_millis(resolver.config().lock_timeout_ms),
        )
    }

    /// Lists matching items, strongest tier first, then by score descending.
    ///
    /// Decisions carry no tier and sort after every duplicate.
    ///
    /// # Errors
    /// Store failures.
    pub fn list_review_queue(&self, filter: &ReviewFilter, limit: usize, offset: usize) -> ResolverResult<ReviewPage> {
        let mut items = self.reviews.query(filter)?;

        let mut counts = std::collections::BTreeMap::new();
        for item in &items {
            *counts.entry(item.bucket()).or_default() += 1;
        }

        items.sort_by(|a, b| {
            rank(a)
                .cmp(&rank(b))
                .then_with(|| b.score().total_cmp(&a.score()))
                .then_with(|| a.id().cmp(&b.id()))
        });
        let total = items.len();
        let items = items.into_iter().skip(offset).take(limit).collect();

        Ok(ReviewPage {
            items,
            total,
            counts_by_tier_and_type: counts,
        })
    }

    /// Applies `action` to one pending item.
    ///
    /// # Errors
    /// - `ReviewItemNotFound` for an unknown id.
    /// - `AlreadyResolved` if the item is terminal; nothing changes.
    /// - `EntityNotFound` if an entity the action needs no longer exists.
    /// - `MergeConflict` if both sides were merged elsewhere.
    /// - `ResolutionUnavailable` if the edit lock stays busy.
    pub fn resolve_review_item(
        &self,
        id: ReviewItemId,
        action: ReviewAction,
        reviewer: &str,
        notes: Option<&str>,
    ) -> ResolverResult<ReviewItem> {
        let item = self.pending_item(id)?;
        let notes = notes.map(str::to_string);

        let resolved = match item {
            ReviewItem::Duplicate(candidate) => self.resolve_duplicate(&candidate, action, reviewer, notes)?,
            ReviewItem::Decision(decision) => self.resolve_decision(&decision, action, reviewer, notes)?,
        };

        tracing::info!(
            item_id = %id,
            kind = %resolved.kind(),
            %action,
            reviewer,
            "review item resolved"
        );
        Ok(resolved)
    }

    /// Applies `action` to every id, continuing past failures.
    #[must_use]
    pub fn batch_resolve(
        &self,
        ids: &[ReviewItemId],
        action: ReviewAction,
        reviewer: &str,
        notes: Option<&str>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for &id in ids {
            match self.resolve_review_item(id, action, reviewer, notes) {
                Ok(_) => outcome.succeeded += 1,
                Err(e) => {
                    tracing::warn!(item_id = %id, error = %e, "batch item failed");
                    outcome.failed += 1;
                    outcome.failures.push(BatchFailure {
                        id,
                        error: e.to_string(),
                        retryable: e.is_retryable(),
                    });
                }
            }
        }
        tracing::info!(
            %action,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "batch resolution complete"
        );
        outcome
    }

    fn pending_item(&self, id: ReviewItemId) -> ResolverResult<ReviewItem> {
        let item = self
            .reviews
            .get_item(id)?
            .ok_or(ResolutionError::ReviewItemNotFound { id })?;
        if !item.is_pending() {
            return Err(ResolutionError::AlreadyResolved { id }.into());
        }
        Ok(item)
    }

    /// Locks the pair `live_pair` computes, then re-checks that `id` is
    /// still pending: another reviewer may have finished while we waited.
    ///
    /// A merge can move an entity between computing the pair and taking the
    /// lock, so the pair is recomputed under the lock and the attempt repeats
    /// if it changed.
    fn lock_pending<F>(&self, id: ReviewItemId, live_pair: F) -> ResolverResult<EditLock<'_>>
    where
        F: Fn() -> ResolverResult<EntityPair>,
    {
        // The store treats a repeated holder as re-entry, so each call gets its own.
        let holder = format!("review:{id}:{}", Uuid::new_v4());
        for attempt in 1..=MAX_LOCK_ATTEMPTS {
            let pair = live_pair()?;
            let lock = EditLock::acquire(self.entities.as_ref(), pair, holder.clone(), self.lock_timeout)?;
            if live_pair()? == pair {
                self.pending_item(id)?;
                return Ok(lock);
            }
            tracing::debug!(item_id = %id, attempt, "entities moved while locking, retrying");
        }
        Err(ResolutionError::unavailable(None, format!("entities behind review item {id} kept moving")).into())
    }

    /// The entity `id` now lives in, or `id` itself if it is not stored.
    fn live_id(&self, id: EntityId) -> ResolverResult<EntityId> {
        match self.entities.canonical_id(id) {
            Ok(live) => Ok(live),
            Err(StorageError::EntityNotFound(_)) => Ok(id),
            Err(e) => Err(e.into()),
        }
    }

    /// Locks the live entities behind a duplicate row.
    fn lock_duplicate(&self, candidate: &DedupCandidate) -> ResolverResult<EditLock<'_>> {
        let (canonical, other) = (candidate.canonical_entity_id, candidate.candidate_entity_id);
        self.lock_pending(candidate.duplicate_id, || {
            Ok(EntityPair::new(self.live_id(canonical)?, self.live_id(other)?))
        })
    }

    /// Locks the entity a decision would create together with the live top
    /// candidate. Returns the lock and the live top candidate.
    fn lock_decision(&self, decision: &MatchDecision) -> ResolverResult<(EditLock<'_>, Option<EntityId>)> {
        let own = EntityId::for_record(decision.incoming_record_ref);
        let top = decision.top_candidate_entity_id;
        let live_top = || top.map(|t| self.live_id(t)).transpose();
        let lock = self.lock_pending(decision.decision_id, || {
            Ok(EntityPair::new(own, live_top()?.unwrap_or(own)))
        })?;
        // Stable while the lock is held.
        Ok((lock, live_top()?))
    }

    fn complete(&self, id: ReviewItemId, outcome: &ReviewOutcome) -> ResolverResult<ReviewItem> {
        Ok(self.reviews.complete(id, outcome)?)
    }

    fn resolve_duplicate(
        &self,
        candidate: &DedupCandidate,
        action: ReviewAction,
        reviewer: &str,
        notes: Option<String>,
    ) -> ResolverResult<ReviewItem> {
        let id = candidate.duplicate_id;
        let resolution = ReviewResolution::for_action(action);
        let _lock = self.lock_duplicate(candidate)?;
        match action {
            ReviewAction::Merge => self.merge_duplicate(candidate, reviewer, notes),
            ReviewAction::Approve | ReviewAction::KeepSeparate => {
                self.reviews.suppress(candidate.pair())?;
                self.complete(id, &ReviewOutcome::new(resolution, reviewer, notes))
            }
            ReviewAction::Dismiss | ReviewAction::Reject => {
                self.complete(id, &ReviewOutcome::new(resolution, reviewer, notes))
            }
        }
    }

    /// Caller holds the lock on the pair's live entities.
    fn merge_duplicate(
        &self,
        candidate: &DedupCandidate,
        reviewer: &str,
        notes: Option<String>,
    ) -> ResolverResult<ReviewItem> {
        let id = candidate.duplicate_id;
        let (canonical, other) = (candidate.canonical_entity_id, candidate.candidate_entity_id);

        let live_canonical = self.entities.canonical_id(canonical)?;
        let live_other = self.entities.canonical_id(other)?;
        if live_canonical == live_other {
            return Err(ResolutionError::MergeConflict {
                canonical,
                candidate: other,
                reason: format!("both already resolve to {live_canonical}"),
            }
            .into());
        }
        if live_canonical != canonical && live_other != other {
            return Err(ResolutionError::MergeConflict {
                canonical,
                candidate: other,
                reason: "both sides were already merged elsewhere".to_string(),
            }
            .into());
        }

        let merged = self.entities.merge(live_canonical, live_other)?;
        let resolved = self.complete(id, &ReviewOutcome::new(ReviewResolution::Merged, reviewer, notes))?;

        let touched: BTreeSet<EntityId> = [canonical, other, live_canonical, live_other].into_iter().collect();
        let superseded = self.supersede_referencing(&touched, id, reviewer)?;

        tracing::info!(
            item_id = %id,
            canonical = %merged.entity_id,
            merged = %live_other,
            superseded,
            "merged duplicate pair"
        );
        Ok(resolved)
    }

    /// Closes every other pending item pointing at one of `entities`.
    fn supersede_referencing(
        &self,
        entities: &BTreeSet<EntityId>,
        cause: ReviewItemId,
        reviewer: &str,
    ) -> ResolverResult<usize> {
        let mut ids = BTreeSet::new();
        for entity in entities {
            for item in self.reviews.pending_referencing(*entity)? {
                if item.id() != cause {
                    ids.insert(item.id());
                }
            }
        }

        let outcome = ReviewOutcome::new(
            ReviewResolution::Superseded,
            reviewer,
            Some(format!("superseded by merge in {cause}")),
        );
        let mut closed = 0;
        for id in ids {
            match self.reviews.complete(id, &outcome) {
                Ok(_) => closed += 1,
                Err(e) => {
                    let err = ResolverError::from(e);
                    if !err.is_already_resolved() {
                        return Err(err);
                    }
                }
            }
        }
        Ok(closed)
    }

    fn resolve_decision(
        &self,
        decision: &MatchDecision,
        action: ReviewAction,
        reviewer: &str,
        notes: Option<String>,
    ) -> ResolverResult<ReviewItem> {
        let id = decision.decision_id;
        let resolution = ReviewResolution::for_action(action);
        if action == ReviewAction::Merge && decision.top_candidate_entity_id.is_none() {
            return Err(ValidationError::UnsupportedAction {
                action: action.to_string(),
                kind: "decision without a candidate".to_string(),
            }
            .into());
        }
        let (_lock, live_top) = self.lock_decision(decision)?;
        match action {
            ReviewAction::Merge => {
                let target = live_top.ok_or_else(|| ResolverError::internal("merge lost its candidate"))?;
                let entity = attach_evidence(self.entities.as_ref(), target, &decision.signals, &decision.source_system)?;
                self.complete(
                    id,
                    &ReviewOutcome::new(resolution, reviewer, notes).with_entity(entity.entity_id),
                )
            }
            ReviewAction::Approve | ReviewAction::KeepSeparate => {
                let entity = create_entity(
                    self.entities.as_ref(),
                    EntityId::for_record(decision.incoming_record_ref),
                    &decision.signals,
                    &decision.source_system,
                    None,
                )?;
                if let Some(top) = live_top {
                    self.reviews.suppress(EntityPair::new(entity.entity_id, top))?;
                }
                self.complete(
                    id,
                    &ReviewOutcome::new(resolution, reviewer, notes).with_entity(entity.entity_id),
                )
            }
            ReviewAction::Dismiss | ReviewAction::Reject => {
                self.complete(id, &ReviewOutcome::new(resolution, reviewer, notes))
            }
        }
    }
}
