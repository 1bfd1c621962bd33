use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use contact_resolver::review::ReviewOutcome;
use contact_resolver::storage::{InMemoryReviewStore, InMemoryStores, UpsertOutcome};
use contact_resolver::{
    CandidateEntity, Classifier, DecisionType, DedupCandidate, EntityId, EntityPair, EntityStore, HouseholdPolicy,
    HouseholdStore, IncomingRecord, MatchDecision, NormalizedSignals, RecordId, ResolutionConfig, ResolutionRuntime,
    ResolutionRuntimeConfig, Resolver, ReviewFilter, ReviewItem, ReviewItemId, ReviewQueue, ReviewStore,
    ScoredCandidate, Scorer, SignalKind, SignalScores, SignalWeights, SourceSystem, StorageError, Thresholds,
};

fn resolver_with(entities: &[CandidateEntity]) -> (Resolver, InMemoryStores) {
    let stores = InMemoryStores::new();
    for e in entities {
        stores.entities.insert(e.clone()).unwrap();
    }
    let resolver = Resolver::in_memory(ResolutionConfig::default(), &stores).unwrap();
    (resolver, stores)
}

fn jane() -> CandidateEntity {
    CandidateEntity::new("Jane Doe")
        .with_email("jane@x.com")
        .with_phone("7075550134")
        .with_address("1 elm st")
}

fn classify(scores: SignalScores) -> DecisionType {
    let weights = SignalWeights::default();
    let classifier = Classifier::new(Thresholds::default(), HouseholdPolicy::default());
    let top = ScoredCandidate {
        entity: jane(),
        composite: scores.composite(&weights),
        scores,
    };
    let signals = NormalizedSignals {
        email: Some("jane@x.com".to_string()),
        ..NormalizedSignals::default()
    };
    classifier.classify(&signals, Some(&top), None).decision_type
}

#[test]
fn record_matching_nothing_creates_new_entity() {
    let (resolver, stores) = resolver_with(&[jane()]);
    let record = IncomingRecord::builder(SourceSystem::JotForm)
        .email("zeb@elsewhere.org")
        .phone("415-555-9876")
        .name("Zebulon Quartermaine")
        .build();

    let decision = resolver.resolve(&record).unwrap();
    assert_eq!(decision.decision_type, DecisionType::NewEntity);
    assert_eq!(stores.entities.len(), 2);
}

#[test]
fn full_agreement_auto_matches() {
    let existing = jane();
    let id = existing.entity_id;
    let (resolver, stores) = resolver_with(&[existing]);
    let record = IncomingRecord::builder(SourceSystem::ClinicHq)
        .email("JANE@x.com")
        .phone("+1 (707) 555-0134")
        .name("jane doe")
        .address("1 Elm Street")
        .build();

    let decision = resolver.resolve(&record).unwrap();
    assert_eq!(decision.decision_type, DecisionType::AutoMatch);
    assert!((decision.composite_score - 1.0).abs() < 1e-9);
    assert_eq!(decision.resolved_entity_id, Some(id));
    assert_eq!(
        decision.matched_on,
        vec![SignalKind::Email, SignalKind::Phone, SignalKind::Name, SignalKind::Address]
    );
    assert_eq!(stores.entities.len(), 1);
}

#[test]
fn phone_only_match_never_auto_matches() {
    let (resolver, _stores) = resolver_with(&[jane()]);
    let variants = [
        IncomingRecord::builder(SourceSystem::JotForm).phone("7075550134").build(),
        IncomingRecord::builder(SourceSystem::JotForm)
            .phone("7075550134")
            .name("Jane Doe")
            .build(),
        IncomingRecord::builder(SourceSystem::Airtable)
            .phone("707.555.0134")
            .name("Jane Doe")
            .address("1 Elm St")
            .build(),
    ];
    for record in &variants {
        let decision = resolver.resolve(record).unwrap();
        assert_ne!(decision.decision_type, DecisionType::AutoMatch, "{record:?}");
    }
}

#[test]
fn exact_email_alone_goes_to_review() {
    let (resolver, stores) = resolver_with(&[jane()]);
    let record = IncomingRecord::builder(SourceSystem::JotForm).email("a@x.com").build();
    let unrelated = resolver.resolve(&record).unwrap();
    assert_eq!(unrelated.decision_type, DecisionType::NewEntity);

    let record = IncomingRecord::builder(SourceSystem::JotForm).email("jane@x.com").build();
    let decision = resolver.resolve(&record).unwrap();
    assert_eq!(decision.per_signal_scores, SignalScores::new(1.0, 0.0, 0.0, 0.0).unwrap());
    assert!((decision.composite_score - 0.40).abs() < 1e-9);
    assert_eq!(decision.decision_type, DecisionType::ReviewPending);

    let queue = ReviewQueue::for_resolver(&resolver);
    let page = queue.list_review_queue(&ReviewFilter::pending(), 10, 0).unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id(), decision.decision_id);
    assert_eq!(stores.entities.len(), 2);
}

#[test]
fn composite_bands() {
    assert_eq!(
        classify(SignalScores::new(1.0, 1.0, 0.8, 0.0).unwrap()),
        DecisionType::ReviewPending
    );
    assert_eq!(
        classify(SignalScores::new(1.0, 1.0, 1.0, 1.0).unwrap()),
        DecisionType::AutoMatch
    );
    assert_eq!(
        classify(SignalScores::new(1.0, 1.0, 1.0, 0.8).unwrap()),
        DecisionType::AutoMatch
    );
}

#[test]
fn co_residents_share_a_household_and_stay_separate() {
    let anchor = CandidateEntity::new("Robert Kowalski")
        .with_phone("7075550134")
        .with_address("1 elm st");
    let anchor_id = anchor.entity_id;
    let (resolver, stores) = resolver_with(&[anchor]);

    let maria = IncomingRecord::builder(SourceSystem::JotForm)
        .phone("707-555-0134")
        .name("Maria Lopez")
        .address("1 Elm Street")
        .build();
    let first = resolver.resolve(&maria).unwrap();
    assert_eq!(first.decision_type, DecisionType::HouseholdMember);
    let household_id = first.household_id.unwrap();

    let teen = IncomingRecord::builder(SourceSystem::ClinicHq)
        .phone("7075550134")
        .name("Tomasz Lopez")
        .address("1 elm st")
        .build();
    let second = resolver.resolve(&teen).unwrap();
    assert_eq!(second.decision_type, DecisionType::HouseholdMember);
    assert_eq!(second.household_id, Some(household_id));

    let household = stores.households.get(household_id).unwrap().unwrap();
    assert_eq!(household.members.len(), 3);
    assert!(household.has_member(anchor_id));
    assert_eq!(stores.entities.len(), 3);
}

#[test]
fn household_override_can_be_disabled() {
    let anchor = CandidateEntity::new("Robert Kowalski")
        .with_phone("7075550134")
        .with_address("1 elm st");
    let stores = InMemoryStores::new();
    stores.entities.insert(anchor).unwrap();
    let mut config = ResolutionConfig::default();
    config.household.enabled = false;
    let resolver = Resolver::in_memory(config, &stores).unwrap();

    let record = IncomingRecord::builder(SourceSystem::JotForm)
        .phone("7075550134")
        .name("Maria Lopez")
        .address("1 Elm St")
        .build();
    let decision = resolver.resolve(&record).unwrap();
    assert_eq!(decision.decision_type, DecisionType::NewEntity);
    assert!(decision.household_id.is_none());
}

#[test]
fn malformed_signal_degrades_to_zero_and_is_reported() {
    let (resolver, _stores) = resolver_with(&[jane()]);
    let record = IncomingRecord::builder(SourceSystem::LegacyImport)
        .email("jane at x dot com")
        .phone("7075550134")
        .name("Jane Doe")
        .address("1 elm st")
        .build();

    let decision = resolver.resolve(&record).unwrap();
    assert_eq!(decision.signal_issues.len(), 1);
    assert_eq!(decision.signal_issues[0].signal, SignalKind::Email);
    assert!(decision.per_signal_scores.email.abs() < f64::EPSILON);
    assert!((decision.composite_score - 0.60).abs() < 1e-9);
    assert_eq!(decision.decision_type, DecisionType::ReviewPending);
}

#[test]
fn ties_prefer_most_recently_seen_candidate() {
    let mut older = CandidateEntity::new("Sam Lee").with_phone("7075550100");
    older.last_seen_at = older.last_seen_at - chrono::Duration::days(30);
    let newer = CandidateEntity::new("Sam Lee").with_phone("7075550100");
    let newer_id = newer.entity_id;
    let (resolver, _stores) = resolver_with(&[older, newer]);

    let record = IncomingRecord::builder(SourceSystem::Manual)
        .phone("7075550100")
        .name("Sam Lee")
        .build();
    let decision = resolver.resolve(&record).unwrap();
    assert_eq!(decision.top_candidate_entity_id, Some(newer_id));
}

/// Review store that drops its connection on the first decision write.
struct DroppingReviews {
    inner: InMemoryReviewStore,
    failures_left: AtomicUsize,
}

impl ReviewStore for DroppingReviews {
    fn insert_decision(&self, decision: MatchDecision) -> Result<(), StorageError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::ConnectionError("connection reset".into()));
        }
        self.inner.insert_decision(decision)
    }
    fn get_decision(&self, id: ReviewItemId) -> Result<Option<MatchDecision>, StorageError> {
        self.inner.get_decision(id)
    }
    fn decision_for_record(&self, record: RecordId) -> Result<Option<MatchDecision>, StorageError> {
        self.inner.decision_for_record(record)
    }
    fn upsert_duplicate(&self, candidate: DedupCandidate) -> Result<UpsertOutcome, StorageError> {
        self.inner.upsert_duplicate(candidate)
    }
    fn get_duplicate(&self, id: ReviewItemId) -> Result<Option<DedupCandidate>, StorageError> {
        self.inner.get_duplicate(id)
    }
    fn get_item(&self, id: ReviewItemId) -> Result<Option<ReviewItem>, StorageError> {
        self.inner.get_item(id)
    }
    fn query(&self, filter: &ReviewFilter) -> Result<Vec<ReviewItem>, StorageError> {
        self.inner.query(filter)
    }
    fn pending_referencing(&self, entity: EntityId) -> Result<Vec<ReviewItem>, StorageError> {
        self.inner.pending_referencing(entity)
    }
    fn complete(&self, id: ReviewItemId, outcome: &ReviewOutcome) -> Result<ReviewItem, StorageError> {
        self.inner.complete(id, outcome)
    }
    fn suppress(&self, pair: EntityPair) -> Result<(), StorageError> {
        self.inner.suppress(pair)
    }
    fn is_suppressed(&self, pair: EntityPair) -> Result<bool, StorageError> {
        self.inner.is_suppressed(pair)
    }
}

#[test]
fn runtime_retry_after_storage_failure_matches_clean_run() {
    let existing = jane();
    let record = IncomingRecord::builder(SourceSystem::ClinicHq)
        .email("maria@elsewhere.org")
        .phone("415-555-0101")
        .name("Maria Lopez")
        .build();

    let (clean, _) = resolver_with(&[existing.clone()]);
    let expected = clean.resolve(&record).unwrap();
    assert_eq!(expected.decision_type, DecisionType::NewEntity);

    let stores = InMemoryStores::new();
    stores.entities.insert(existing).unwrap();
    let reviews = Arc::new(DroppingReviews {
        inner: InMemoryReviewStore::new(),
        failures_left: AtomicUsize::new(1),
    });
    let resolver = Resolver::new(
        ResolutionConfig::default(),
        stores.entities.clone(),
        stores.households.clone(),
        reviews.clone(),
    )
    .unwrap();
    let runtime = ResolutionRuntime::start(resolver, &ResolutionRuntimeConfig::default()).unwrap();

    let decision = runtime.resolve(record.clone()).unwrap();
    assert_eq!(decision.decision_type, expected.decision_type);
    assert_eq!(decision.resolved_entity_id, Some(EntityId::for_record(record.record_id)));
    assert_eq!(stores.entities.len(), 2);
    assert!(reviews.query(&ReviewFilter::pending()).unwrap().is_empty());
}

#[test]
fn absent_name_scores_zero_against_unnamed_entity() {
    let (resolver, stores) = resolver_with(&[]);
    let email_only = IncomingRecord::builder(SourceSystem::JotForm).email("jane@xcom.org").build();
    let created = resolver.resolve(&email_only).unwrap().resolved_entity_id.unwrap();
    let stored = stores.entities.get(created).unwrap().unwrap();
    assert!(!stored.has_name());

    let scorer = Scorer::new(SignalWeights::default(), 0.5);
    let name_only = NormalizedSignals {
        name: contact_resolver::normalize::normalize_name("Jane Xcom Org"),
        ..NormalizedSignals::default()
    };
    let scored = scorer.score(&name_only, stored);
    assert!(scored.scores.name.abs() < f64::EPSILON);
    assert!(scored.composite.abs() < f64::EPSILON);
}
