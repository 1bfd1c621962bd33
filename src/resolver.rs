//! Real-time resolution of incoming records.
//!
//! `Resolver::resolve` runs the full pipeline for one record: normalize,
//! retrieve candidates, score, classify, apply the decision's effects and
//! persist the decision. The decision is written last. The entity a record
//! creates is keyed by the record, so an attempt that fails after creating it
//! leaves state the retry picks up again instead of matching against.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::candidates::CandidateFinder;
use crate::config::ResolutionConfig;
use crate::decision::{Classification, Classifier, DecisionType, HouseholdContext, MatchDecision};
use crate::entity::{CandidateEntity, EntityId};
use crate::error::{ResolutionError, ResolverError, ResolverResult};
use crate::household::{Household, HouseholdId, InferredFrom, PlaceId};
use crate::normalize::{AddressNormalizer, AddressResolver, BasicAddressNormalizer, NormalizedSignals, SignalNormalizer};
use crate::record::{IncomingRecord, SourceSystem};
use crate::review::ReviewItemId;
use crate::scoring::{ScoredCandidate, Scorer, SignalScores};
use crate::storage::{EntityStore, HouseholdStore, InMemoryStores, ReviewStore, StorageError};

const MAX_UPDATE_ATTEMPTS: usize = 3;
const RESIDENT_SCAN_LIMIT: usize = 64;

/// Folds `signals` into entity `id` as corroborating evidence.
///
/// Retries on concurrent version bumps. Returns the updated entity.
pub(crate) fn attach_evidence(
    entities: &dyn EntityStore,
    id: EntityId,
    signals: &NormalizedSignals,
    source: &SourceSystem,
) -> ResolverResult<CandidateEntity> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut entity = entities
            .get(id)?
            .ok_or(ResolutionError::EntityNotFound { id })?;
        entity.absorb(signals, source);
        entity.version += 1;
        match entities.update(entity.clone()) {
            Ok(()) => return Ok(entity),
            Err(StorageError::StaleVersion { .. }) if attempt < MAX_UPDATE_ATTEMPTS => {
                tracing::debug!(entity_id = %id, attempt, "stale entity version, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Creates and stores the entity `id` from `signals`.
///
/// If `id` already exists, an earlier attempt created it; that entity is
/// returned, moved into `household` if it is not there yet.
pub(crate) fn create_entity(
    entities: &dyn EntityStore,
    id: EntityId,
    signals: &NormalizedSignals,
    source: &SourceSystem,
    household: Option<HouseholdId>,
) -> ResolverResult<CandidateEntity> {
    let mut entity = CandidateEntity::from_signals(signals, source);
    entity.entity_id = id;
    entity.household_id = household;
    match entities.insert(entity.clone()) {
        Ok(()) => Ok(entity),
        Err(StorageError::DuplicateKey(_)) => {
            tracing::debug!(entity_id = %id, "entity exists from an earlier attempt");
            let mut attempt = 0;
            loop {
                attempt += 1;
                let mut existing = entities.get(id)?.ok_or(ResolutionError::EntityNotFound { id })?;
                if household.is_none() || existing.household_id == household {
                    return Ok(existing);
                }
                existing.household_id = household;
                existing.version += 1;
                match entities.update(existing.clone()) {
                    Ok(()) => return Ok(existing),
                    Err(StorageError::StaleVersion { .. }) if attempt < MAX_UPDATE_ATTEMPTS => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Outcome of applying a classification's effects.
#[derive(Debug, Default)]
struct Applied {
    resolved_entity_id: Option<EntityId>,
    household_id: Option<HouseholdId>,
}

/// Resolves incoming records against the entity store.
pub struct Resolver {
    config: ResolutionConfig,
    normalizer: SignalNormalizer,
    finder: CandidateFinder,
    scorer: Scorer,
    classifier: Classifier,
    entities: Arc<dyn EntityStore>,
    households: Arc<dyn HouseholdStore>,
    reviews: Arc<dyn ReviewStore>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("config", &self.config)
            .field("normalizer", &self.normalizer)
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// Creates a resolver over the given stores, using the offline address
    /// normalizer.
    ///
    /// # Errors
    /// `ValidationError::InvalidConfig` if `config` is invalid.
    pub fn new(
        config: ResolutionConfig,
        entities: Arc<dyn EntityStore>,
        households: Arc<dyn HouseholdStore>,
        reviews: Arc<dyn ReviewStore>,
    ) -> ResolverResult<Self> {
        Self::with_address_normalizer(config, entities, households, reviews, Arc::new(BasicAddressNormalizer))
    }

    /// Creates a resolver that canonicalizes addresses through `addresses`.
    ///
    /// # Errors
    /// - `ValidationError::InvalidConfig` if `config` is invalid.
    /// - `Internal` if the address workers cannot be started.
    pub fn with_address_normalizer(
        config: ResolutionConfig,
        entities: Arc<dyn EntityStore>,
        households: Arc<dyn HouseholdStore>,
        reviews: Arc<dyn ReviewStore>,
        addresses: Arc<dyn AddressNormalizer>,
    ) -> ResolverResult<Self> {
        config.validate()?;
        let address_resolver = AddressResolver::new(
            addresses,
            Duration::from_millis(config.dependency_timeout_ms),
            config.address_cache_capacity,
        )?;
        Ok(Self {
            normalizer: SignalNormalizer::new(address_resolver, config.min_name_length),
            finder: CandidateFinder::new(Arc::clone(&entities), config.candidates_per_signal),
            scorer: Scorer::new(config.weights, config.name_floor),
            classifier: Classifier::new(config.thresholds, config.household),
            config,
            entities,
            households,
            reviews,
        })
    }

    /// Creates a resolver over an in-memory store bundle.
    ///
    /// # Errors
    /// `ValidationError::InvalidConfig` if `config` is invalid.
    pub fn in_memory(config: ResolutionConfig, stores: &InMemoryStores) -> ResolverResult<Self> {
        Self::new(
            config,
            stores.entities.clone(),
            stores.households.clone(),
            stores.reviews.clone(),
        )
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ResolutionConfig {
        &self.config
    }

    /// The signal normalizer.
    #[must_use]
    pub const fn normalizer(&self) -> &SignalNormalizer {
        &self.normalizer
    }

    /// Entity store handle.
    #[must_use]
    pub fn entities(&self) -> Arc<dyn EntityStore> {
        Arc::clone(&self.entities)
    }

    /// Review store handle.
    #[must_use]
    pub fn reviews(&self) -> Arc<dyn ReviewStore> {
        Arc::clone(&self.reviews)
    }

    /// Resolves one incoming record.
    ///
    /// Resolving a record that already has a decision returns that decision
    /// without re-applying effects.
    ///
    /// A record whose signals were all absent or malformed is `rejected`, not
    /// `new_entity`: with nothing to identify the person, no entity is created
    /// and the decision lists the signal issues. A record with at least one
    /// usable signal and no candidate above the review threshold is
    /// `new_entity`.
    ///
    /// # Errors
    /// - `ResolutionUnavailable` if a store or the address service cannot be
    ///   reached. No decision is stored. Retrying the record reaches the same
    ///   outcome as a first attempt would have, because the entity it creates
    ///   is keyed by the record id.
    /// - `EntityNotFound` if the chosen candidate vanished mid-resolution.
    pub fn resolve(&self, record: &IncomingRecord) -> ResolverResult<MatchDecision> {
        let record_id = record.record_id;
        self.resolve_inner(record).map_err(|e| e.for_record(record_id))
    }

    fn resolve_inner(&self, record: &IncomingRecord) -> ResolverResult<MatchDecision> {
        if let Some(existing) = self.reviews.decision_for_record(record.record_id)? {
            tracing::debug!(record_id = %record.record_id, decision_id = %existing.decision_id, "record already resolved");
            return Ok(existing);
        }

        let signals = self.normalizer.normalize(record)?;
        // An earlier failed attempt may have stored this record's own entity.
        let own_id = EntityId::for_record(record.record_id);

        let ranked = if signals.has_any() {
            let candidates = self.finder.find_excluding(&signals, own_id)?;
            self.scorer.rank(&signals, candidates)
        } else {
            Vec::new()
        };
        let top = ranked.first();

        let context = match top {
            Some(top) if self.classifier.household_pattern(&signals, top).is_some() => {
                self.household_context(&top.entity, own_id)?
            }
            _ => None,
        };

        let classification = self.classifier.classify(&signals, top, context.as_ref());
        let applied = self.apply(record, &signals, top, &classification)?;

        let (scores, composite) = top.map_or((SignalScores::default(), 0.0), |t| (t.scores, t.composite));
        let decision = MatchDecision {
            decision_id: ReviewItemId::new(),
            incoming_record_ref: record.record_id,
            source_system: record.source_system.clone(),
            decision_type: classification.decision_type,
            top_candidate_entity_id: top.map(|t| t.entity.entity_id),
            resolved_entity_id: applied.resolved_entity_id,
            household_id: applied.household_id,
            composite_score: composite,
            per_signal_scores: scores,
            matched_on: scores.matched_on(),
            signal_issues: signals.issues.clone(),
            signals,
            decision_reason: classification.reason,
            processed_at: Utc::now(),
            reviewed_at: None,
            reviewed_by: None,
            review_notes: None,
            resolution: None,
        };

        match self.reviews.insert_decision(decision.clone()) {
            Ok(()) => {}
            Err(StorageError::DuplicateKey(_)) => {
                // Lost a race with a concurrent resolution of the same record.
                if let Some(existing) = self.reviews.decision_for_record(record.record_id)? {
                    tracing::warn!(record_id = %record.record_id, "concurrent resolution, keeping first decision");
                    return Ok(existing);
                }
                return Err(ResolverError::internal(format!(
                    "decision for record {} reported duplicate but not found",
                    record.record_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            record_id = %record.record_id,
            decision_id = %decision.decision_id,
            decision_type = %decision.decision_type,
            composite = decision.composite_score,
            source = %decision.source_system,
            "record resolved"
        );
        Ok(decision)
    }

    /// Place and resident count the household override would use for `candidate`.
    ///
    /// `own_id` is never counted as a resident.
    fn household_context(
        &self,
        candidate: &CandidateEntity,
        own_id: EntityId,
    ) -> ResolverResult<Option<HouseholdContext>> {
        let place = match candidate.household_id {
            Some(id) => self.households.get(id)?.map(|h| h.primary_place_id),
            None => None,
        }
        .or_else(|| candidate.address.clone().map(PlaceId::new));
        let Some(place) = place else {
            return Ok(None);
        };

        let mut residents: BTreeSet<EntityId> = BTreeSet::new();
        for household in self.households.find_by_place(&place)? {
            residents.extend(household.member_ids());
        }
        for entity in self.entities.find_by_address(place.as_str(), RESIDENT_SCAN_LIMIT)? {
            residents.insert(entity.entity_id);
        }
        residents.remove(&own_id);
        Ok(Some(HouseholdContext {
            place,
            residents: residents.len(),
        }))
    }

    fn apply(
        &self,
        record: &IncomingRecord,
        signals: &NormalizedSignals,
        top: Option<&ScoredCandidate>,
        classification: &Classification,
    ) -> ResolverResult<Applied> {
        let source = &record.source_system;
        let own_id = EntityId::for_record(record.record_id);
        match classification.decision_type {
            DecisionType::AutoMatch => {
                let top = top.ok_or_else(|| ResolverError::internal("auto_match without a candidate"))?;
                let entity = attach_evidence(self.entities.as_ref(), top.entity.entity_id, signals, source)?;
                Ok(Applied {
                    resolved_entity_id: Some(entity.entity_id),
                    household_id: entity.household_id,
                })
            }
            DecisionType::NewEntity => {
                let entity = create_entity(self.entities.as_ref(), own_id, signals, source, None)?;
                Ok(Applied {
                    resolved_entity_id: Some(entity.entity_id),
                    household_id: None,
                })
            }
            DecisionType::HouseholdMember => {
                let top = top.ok_or_else(|| ResolverError::internal("household_member without a candidate"))?;
                let (place, inferred) = classification
                    .household
                    .clone()
                    .ok_or_else(|| ResolverError::internal("household_member without a place"))?;
                self.join_household(own_id, signals, source, &top.entity, place, inferred)
            }
            DecisionType::ReviewPending | DecisionType::Rejected => Ok(Applied::default()),
        }
    }

    /// Creates the record's entity and adds it to the household at `place`,
    /// creating the household around `anchor` if none exists yet.
    fn join_household(
        &self,
        own_id: EntityId,
        signals: &NormalizedSignals,
        source: &SourceSystem,
        anchor: &CandidateEntity,
        place: PlaceId,
        inferred: InferredFrom,
    ) -> ResolverResult<Applied> {
        let existing = self.households.find_by_place(&place)?.into_iter().next();
        let (mut household, is_new) = match existing {
            Some(h) => (h, false),
            None => (Household::new(place, anchor.entity_id), true),
        };

        let entity = create_entity(
            self.entities.as_ref(),
            own_id,
            signals,
            source,
            Some(household.household_id),
        )?;
        household.add_member(
            entity.entity_id,
            self.config.household.member_confidence,
            Some(inferred),
        );
        if is_new {
            self.households.insert(household.clone())?;
        } else {
            self.households.update(household.clone())?;
        }

        if anchor.household_id.is_none() && household.has_member(anchor.entity_id) {
            self.set_household(anchor.entity_id, household.household_id)?;
        }

        tracing::debug!(
            entity_id = %entity.entity_id,
            household_id = %household.household_id,
            place = %household.primary_place_id,
            %inferred,
            "added household member"
        );
        Ok(Applied {
            resolved_entity_id: Some(entity.entity_id),
            household_id: Some(household.household_id),
        })
    }

    fn set_household(&self, id: EntityId, household: HouseholdId) -> ResolverResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut entity = self
                .entities
                .get(id)?
                .ok_or(ResolutionError::EntityNotFound { id })?;
            if entity.household_id.is_some() {
                return Ok(());
            }
            entity.household_id = Some(household);
            entity.version += 1;
            match self.entities.update(entity) {
                Ok(()) => return Ok(()),
                Err(StorageError::StaleVersion { .. }) if attempt < MAX_UPDATE_ATTEMPTS => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}
