//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::decision::{DecisionType, MatchDecision};
use crate::dedup::DedupCandidate;
use crate::entity::{CandidateEntity, EntityId, EntityPair};
use crate::household::{Household, HouseholdId, PlaceId};
use crate::normalize::{name_key, trigrams};
use crate::record::RecordId;
use crate::review::{ReviewFilter, ReviewItem, ReviewItemId, ReviewOutcome, ReviewStatus};
use crate::storage::traits::{EntityStore, HouseholdStore, ReviewStore, StorageError, UpsertOutcome};

const MAX_MERGE_HOPS: usize = 128;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct EntityState {
    by_id: HashMap<EntityId, CandidateEntity>,
    by_email: HashMap<String, BTreeSet<EntityId>>,
    by_phone: HashMap<String, BTreeSet<EntityId>>,
    by_address: HashMap<String, BTreeSet<EntityId>>,
    by_trigram: HashMap<String, BTreeSet<EntityId>>,
    merged_into: HashMap<EntityId, EntityId>,
    merged_from: HashMap<EntityId, HashSet<EntityId>>,
    locks: HashMap<EntityId, String>,
}

fn resolve_canonical_id(state: &EntityState, id: EntityId) -> Result<EntityId, StorageError> {
    let mut current = id;
    for _ in 0..MAX_MERGE_HOPS {
        let Some(next) = state.merged_into.get(&current).copied() else {
            return Ok(current);
        };
        if next == current {
            return Err(StorageError::BackendError(
                "entity merge map contains a self-cycle".to_string(),
            ));
        }
        current = next;
    }

    Err(StorageError::BackendError(
        "entity merge map resolution exceeded hop limit".to_string(),
    ))
}

fn index_keys(map: &mut HashMap<String, BTreeSet<EntityId>>, keys: impl IntoIterator<Item = String>, id: EntityId) {
    for key in keys {
        map.entry(key).or_default().insert(id);
    }
}

fn unindex_keys(map: &mut HashMap<String, BTreeSet<EntityId>>, keys: impl IntoIterator<Item = String>, id: EntityId) {
    for key in keys {
        if let Some(set) = map.get_mut(&key) {
            set.remove(&id);
            if set.is_empty() {
                map.remove(&key);
            }
        }
    }
}

fn index_entity(state: &mut EntityState, entity: &CandidateEntity) {
    let id = entity.entity_id;
    index_keys(&mut state.by_email, entity.emails.iter().cloned(), id);
    index_keys(&mut state.by_phone, entity.phones.iter().cloned(), id);
    index_keys(&mut state.by_address, entity.address.iter().cloned(), id);
    index_keys(&mut state.by_trigram, trigrams(&name_key(&entity.display_name)), id);
}

fn unindex_entity(state: &mut EntityState, entity: &CandidateEntity) {
    let id = entity.entity_id;
    unindex_keys(&mut state.by_email, entity.emails.iter().cloned(), id);
    unindex_keys(&mut state.by_phone, entity.phones.iter().cloned(), id);
    unindex_keys(&mut state.by_address, entity.address.iter().cloned(), id);
    unindex_keys(&mut state.by_trigram, trigrams(&name_key(&entity.display_name)), id);
}

/// Most recently seen first, then by id.
fn ranked(state: &EntityState, ids: Option<&BTreeSet<EntityId>>, limit: usize) -> Vec<CandidateEntity> {
    let Some(ids) = ids else {
        return Vec::new();
    };
    let mut found: Vec<CandidateEntity> = ids.iter().filter_map(|id| state.by_id.get(id).cloned()).collect();
    found.sort_by(|a, b| {
        b.last_seen_at
            .cmp(&a.last_seen_at)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    found.truncate(limit);
    found
}

fn merge_into(primary: &mut CandidateEntity, secondary: &CandidateEntity) {
    for email in &secondary.emails {
        primary.add_email(email.clone());
    }
    for phone in &secondary.phones {
        primary.add_phone(phone.clone());
    }
    if primary.address.is_none() {
        primary.address.clone_from(&secondary.address);
    }
    if primary.household_id.is_none() {
        primary.household_id = secondary.household_id;
    }
    if !primary.has_name() {
        primary.display_name.clone_from(&secondary.display_name);
    }
    for source in &secondary.sources {
        if !primary.sources.contains(source) {
            primary.sources.push(source.clone());
        }
    }
    primary.created_at = primary.created_at.min(secondary.created_at);
    primary.last_seen_at = primary.last_seen_at.max(secondary.last_seen_at);
}

/// Thread-safe in-memory entity store.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    state: RwLock<EntityState>,
}

impl InMemoryEntityStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().map_or(0, |s| s.by_id.len())
    }

    /// Returns true if the store holds no live entity.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EntityStore for InMemoryEntityStore {
    fn insert(&self, entity: CandidateEntity) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("entity.insert"))?;
        if state.by_id.contains_key(&entity.entity_id) || state.merged_into.contains_key(&entity.entity_id) {
            return Err(StorageError::DuplicateKey(entity.entity_id.to_string()));
        }
        index_entity(&mut state, &entity);
        state.by_id.insert(entity.entity_id, entity);
        Ok(())
    }

    fn get(&self, id: EntityId) -> Result<Option<CandidateEntity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.get"))?;
        let canonical = resolve_canonical_id(&state, id)?;
        Ok(state.by_id.get(&canonical).cloned())
    }

    fn update(&self, entity: CandidateEntity) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("entity.update"))?;
        let canonical = resolve_canonical_id(&state, entity.entity_id)?;
        if canonical != entity.entity_id {
            return Err(StorageError::BackendError(
                "cannot update an entity that has been merged".to_string(),
            ));
        }
        let prev = state
            .by_id
            .get(&entity.entity_id)
            .cloned()
            .ok_or(StorageError::EntityNotFound(entity.entity_id))?;

        if entity.version <= prev.version {
            return Err(StorageError::StaleVersion {
                id: entity.entity_id,
                current: prev.version,
                attempted: entity.version,
            });
        }

        unindex_entity(&mut state, &prev);
        index_entity(&mut state, &entity);
        state.by_id.insert(entity.entity_id, entity);
        Ok(())
    }

    fn find_by_email(&self, email: &str, limit: usize) -> Result<Vec<CandidateEntity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.find_by_email"))?;
        Ok(ranked(&state, state.by_email.get(email), limit))
    }

    fn find_by_phone(&self, phone: &str, limit: usize) -> Result<Vec<CandidateEntity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.find_by_phone"))?;
        Ok(ranked(&state, state.by_phone.get(phone), limit))
    }

    fn find_by_name_fuzzy(&self, key: &str, limit: usize) -> Result<Vec<CandidateEntity>, StorageError> {
        let query = trigrams(key);
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let state = self.state.read().map_err(|_| lock_err("entity.find_by_name_fuzzy"))?;

        let mut shared: HashMap<EntityId, usize> = HashMap::new();
        for gram in &query {
            if let Some(ids) = state.by_trigram.get(gram) {
                for id in ids {
                    *shared.entry(*id).or_default() += 1;
                }
            }
        }

        let mut scored: Vec<(f64, CandidateEntity)> = shared
            .into_iter()
            .filter_map(|(id, count)| {
                let entity = state.by_id.get(&id)?;
                let own = trigrams(&name_key(&entity.display_name)).len();
                #[allow(clippy::cast_precision_loss)]
                let dice = (2 * count) as f64 / (query.len() + own) as f64;
                Some((dice, entity.clone()))
            })
            .collect();

        scored.sort_by(|(sa, ea), (sb, eb)| {
            sb.total_cmp(sa)
                .then_with(|| eb.last_seen_at.cmp(&ea.last_seen_at))
                .then_with(|| ea.entity_id.cmp(&eb.entity_id))
        });

        Ok(scored.into_iter().take(limit).map(|(_, e)| e).collect())
    }

    fn find_by_address(&self, address: &str, limit: usize) -> Result<Vec<CandidateEntity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.find_by_address"))?;
        Ok(ranked(&state, state.by_address.get(address), limit))
    }

    fn list_all(&self) -> Result<Vec<CandidateEntity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.list_all"))?;
        Ok(state.by_id.values().cloned().collect())
    }

    fn canonical_id(&self, id: EntityId) -> Result<EntityId, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.canonical_id"))?;
        let canonical = resolve_canonical_id(&state, id)?;
        if state.by_id.contains_key(&canonical) {
            Ok(canonical)
        } else {
            Err(StorageError::EntityNotFound(id))
        }
    }

    fn merge(&self, primary: EntityId, secondary: EntityId) -> Result<CandidateEntity, StorageError> {
        if primary == secondary {
            return Err(StorageError::BackendError(
                "cannot merge an entity into itself".to_string(),
            ));
        }

        let mut state = self.state.write().map_err(|_| lock_err("entity.merge"))?;

        let primary_canonical = resolve_canonical_id(&state, primary)?;
        let secondary_canonical = resolve_canonical_id(&state, secondary)?;
        if primary_canonical == secondary_canonical {
            return Err(StorageError::BackendError(
                "cannot merge: both IDs resolve to the same canonical entity".to_string(),
            ));
        }

        let prev_primary = state
            .by_id
            .get(&primary_canonical)
            .cloned()
            .ok_or(StorageError::EntityNotFound(primary))?;
        let secondary_entity = state
            .by_id
            .get(&secondary_canonical)
            .cloned()
            .ok_or(StorageError::EntityNotFound(secondary))?;

        let mut merged = prev_primary.clone();
        merge_into(&mut merged, &secondary_entity);
        merged.version = merged
            .version
            .checked_add(1)
            .ok_or_else(|| StorageError::BackendError("entity version overflow".to_string()))?;

        unindex_entity(&mut state, &prev_primary);
        unindex_entity(&mut state, &secondary_entity);
        index_entity(&mut state, &merged);
        state.by_id.insert(primary_canonical, merged.clone());
        state.by_id.remove(&secondary_canonical);

        state.merged_into.insert(secondary_canonical, primary_canonical);
        state
            .merged_from
            .entry(primary_canonical)
            .or_default()
            .insert(secondary_canonical);

        Ok(merged)
    }

    fn try_lock(&self, pair: EntityPair, holder: &str) -> Result<bool, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("entity.try_lock"))?;
        let sides = [pair.low(), pair.high()];
        if sides
            .iter()
            .any(|id| state.locks.get(id).is_some_and(|current| current != holder))
        {
            return Ok(false);
        }
        for id in sides {
            state.locks.insert(id, holder.to_string());
        }
        Ok(true)
    }

    fn unlock(&self, pair: EntityPair, holder: &str) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("entity.unlock"))?;
        let sides = [pair.low(), pair.high()];
        if let Some((id, current)) = sides
            .iter()
            .find_map(|id| state.locks.get(id).filter(|current| *current != holder).map(|c| (id, c)))
        {
            return Err(StorageError::BackendError(format!(
                "edit lock for {id} is held by {current}, not {holder}"
            )));
        }
        for id in sides {
            state.locks.remove(&id);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct HouseholdState {
    by_id: HashMap<HouseholdId, Household>,
    by_place: HashMap<PlaceId, BTreeSet<HouseholdId>>,
}

/// Thread-safe in-memory household store.
#[derive(Debug, Default)]
pub struct InMemoryHouseholdStore {
    state: RwLock<HouseholdState>,
}

impl InMemoryHouseholdStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl HouseholdStore for InMemoryHouseholdStore {
    fn insert(&self, household: Household) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("household.insert"))?;
        if state.by_id.contains_key(&household.household_id) {
            return Err(StorageError::DuplicateKey(household.household_id.to_string()));
        }
        state
            .by_place
            .entry(household.primary_place_id.clone())
            .or_default()
            .insert(household.household_id);
        state.by_id.insert(household.household_id, household);
        Ok(())
    }

    fn get(&self, id: HouseholdId) -> Result<Option<Household>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("household.get"))?;
        Ok(state.by_id.get(&id).cloned())
    }

    fn update(&self, household: Household) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("household.update"))?;
        let prev_place = state
            .by_id
            .get(&household.household_id)
            .map(|h| h.primary_place_id.clone())
            .ok_or(StorageError::HouseholdNotFound(household.household_id))?;

        if prev_place != household.primary_place_id {
            if let Some(set) = state.by_place.get_mut(&prev_place) {
                set.remove(&household.household_id);
                if set.is_empty() {
                    state.by_place.remove(&prev_place);
                }
            }
            state
                .by_place
                .entry(household.primary_place_id.clone())
                .or_default()
                .insert(household.household_id);
        }
        state.by_id.insert(household.household_id, household);
        Ok(())
    }

    fn find_by_place(&self, place: &PlaceId) -> Result<Vec<Household>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("household.find_by_place"))?;
        let Some(ids) = state.by_place.get(place) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| state.by_id.get(id).cloned()).collect())
    }
}

#[derive(Debug, Default)]
struct ReviewState {
    decisions: HashMap<ReviewItemId, MatchDecision>,
    by_record: HashMap<RecordId, ReviewItemId>,
    duplicates: HashMap<ReviewItemId, DedupCandidate>,
    suppressed: HashSet<EntityPair>,
}

impl ReviewState {
    fn item(&self, id: ReviewItemId) -> Option<ReviewItem> {
        if let Some(d) = self.decisions.get(&id) {
            return (d.decision_type == DecisionType::ReviewPending).then(|| ReviewItem::Decision(d.clone()));
        }
        self.duplicates.get(&id).cloned().map(ReviewItem::Duplicate)
    }

    fn items(&self) -> impl Iterator<Item = ReviewItem> + '_ {
        self.decisions
            .values()
            .filter(|d| d.decision_type == DecisionType::ReviewPending)
            .cloned()
            .map(ReviewItem::Decision)
            .chain(self.duplicates.values().cloned().map(ReviewItem::Duplicate))
    }
}

/// Thread-safe in-memory review store.
#[derive(Debug, Default)]
pub struct InMemoryReviewStore {
    state: RwLock<ReviewState>,
}

impl InMemoryReviewStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every persisted decision, in no particular order.
    ///
    /// # Errors
    /// `BackendError` if the store lock is poisoned.
    pub fn decisions(&self) -> Result<Vec<MatchDecision>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("review.decisions"))?;
        Ok(state.decisions.values().cloned().collect())
    }
}

impl ReviewStore for InMemoryReviewStore {
    fn insert_decision(&self, decision: MatchDecision) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("review.insert_decision"))?;
        if state.by_record.contains_key(&decision.incoming_record_ref) {
            return Err(StorageError::DuplicateKey(format!(
                "decision for record {}",
                decision.incoming_record_ref
            )));
        }
        if state.decisions.contains_key(&decision.decision_id) {
            return Err(StorageError::DuplicateKey(decision.decision_id.to_string()));
        }
        state
            .by_record
            .insert(decision.incoming_record_ref, decision.decision_id);
        state.decisions.insert(decision.decision_id, decision);
        Ok(())
    }

    fn get_decision(&self, id: ReviewItemId) -> Result<Option<MatchDecision>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("review.get_decision"))?;
        Ok(state.decisions.get(&id).cloned())
    }

    fn decision_for_record(&self, record: RecordId) -> Result<Option<MatchDecision>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("review.decision_for_record"))?;
        Ok(state
            .by_record
            .get(&record)
            .and_then(|id| state.decisions.get(id))
            .cloned())
    }

    fn upsert_duplicate(&self, candidate: DedupCandidate) -> Result<UpsertOutcome, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("review.upsert_duplicate"))?;
        let Some(existing) = state.duplicates.get_mut(&candidate.duplicate_id) else {
            state.duplicates.insert(candidate.duplicate_id, candidate);
            return Ok(UpsertOutcome::Inserted);
        };
        if existing.status == ReviewStatus::Resolved {
            return Ok(UpsertOutcome::Unchanged);
        }
        existing.last_scanned_at = candidate.last_scanned_at;
        if existing.similarity_score.total_cmp(&candidate.similarity_score).is_eq() {
            return Ok(UpsertOutcome::Unchanged);
        }
        existing.similarity_score = candidate.similarity_score;
        existing.shared_signal = candidate.shared_signal;
        Ok(UpsertOutcome::Updated)
    }

    fn get_duplicate(&self, id: ReviewItemId) -> Result<Option<DedupCandidate>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("review.get_duplicate"))?;
        Ok(state.duplicates.get(&id).cloned())
    }

    fn get_item(&self, id: ReviewItemId) -> Result<Option<ReviewItem>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("review.get_item"))?;
        Ok(state.item(id))
    }

    fn query(&self, filter: &ReviewFilter) -> Result<Vec<ReviewItem>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("review.query"))?;
        Ok(state.items().filter(|item| filter.matches(item)).collect())
    }

    fn pending_referencing(&self, entity: EntityId) -> Result<Vec<ReviewItem>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("review.pending_referencing"))?;
        Ok(state
            .items()
            .filter(|item| item.is_pending() && item.references(entity))
            .collect())
    }

    fn complete(&self, id: ReviewItemId, outcome: &ReviewOutcome) -> Result<ReviewItem, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("review.complete"))?;

        if let Some(d) = state
            .decisions
            .get_mut(&id)
            .filter(|d| d.decision_type == DecisionType::ReviewPending)
        {
            if d.resolution.is_some() {
                return Err(StorageError::AlreadyResolved(id));
            }
            d.resolution = Some(outcome.resolution);
            d.reviewed_at = Some(outcome.reviewed_at);
            d.reviewed_by = Some(outcome.reviewed_by.clone());
            d.review_notes.clone_from(&outcome.review_notes);
            if outcome.resolved_entity_id.is_some() {
                d.resolved_entity_id = outcome.resolved_entity_id;
            }
            return Ok(ReviewItem::Decision(d.clone()));
        }

        if let Some(c) = state.duplicates.get_mut(&id) {
            if c.status == ReviewStatus::Resolved {
                return Err(StorageError::AlreadyResolved(id));
            }
            c.status = ReviewStatus::Resolved;
            c.resolution = Some(outcome.resolution);
            c.reviewed_at = Some(outcome.reviewed_at);
            c.reviewed_by = Some(outcome.reviewed_by.clone());
            c.review_notes.clone_from(&outcome.review_notes);
            return Ok(ReviewItem::Duplicate(c.clone()));
        }

        Err(StorageError::ReviewItemNotFound(id))
    }

    fn suppress(&self, pair: EntityPair) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("review.suppress"))?;
        state.suppressed.insert(pair);
        Ok(())
    }

    fn is_suppressed(&self, pair: EntityPair) -> Result<bool, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("review.is_suppressed"))?;
        Ok(state.suppressed.contains(&pair))
    }
}

/// Convenience bundle for in-memory stores.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStores {
    /// Entity store.
    pub entities: Arc<InMemoryEntityStore>,
    /// Household store.
    pub households: Arc<InMemoryHouseholdStore>,
    /// Review store.
    pub reviews: Arc<InMemoryReviewStore>,
}

impl InMemoryStores {
    /// Create a new bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
