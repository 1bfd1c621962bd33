use std::sync::Arc;
use std::thread;
use std::time::Duration;

use contact_resolver::review::ReviewKind;
use contact_resolver::storage::{EditLock, InMemoryStores};
use contact_resolver::{
    CandidateEntity, DecisionType, DedupCandidate, EntityId, EntityPair, EntityStore, IncomingRecord, MatchTier,
    ResolutionConfig, Resolver, ReviewAction, ReviewFilter, ReviewItem, ReviewItemId, ReviewQueue, ReviewResolution,
    ReviewStatus, ReviewStore, SourceSystem,
};

fn file_pair(stores: &InMemoryStores, a: &str, b: &str, tier: MatchTier) -> (EntityId, EntityId, ReviewItemId) {
    let first = CandidateEntity::new(a);
    let second = CandidateEntity::new(b);
    let (ida, idb) = (first.entity_id, second.entity_id);
    stores.entities.insert(first).unwrap();
    stores.entities.insert(second).unwrap();
    let row = DedupCandidate::new(ida, idb, tier, "shared", 0.95);
    let id = row.duplicate_id;
    stores.reviews.upsert_duplicate(row).unwrap();
    (ida, idb, id)
}

fn queue(stores: &InMemoryStores, lock_timeout: Duration) -> ReviewQueue {
    ReviewQueue::new(stores.entities.clone(), stores.reviews.clone(), lock_timeout)
}

#[test]
fn re_resolving_reports_already_resolved_and_keeps_fields() {
    let stores = InMemoryStores::new();
    let (_, _, id) = file_pair(&stores, "Ana Ruiz", "Ana Ruiz", MatchTier::NameOnly);
    let q = queue(&stores, Duration::from_millis(200));

    let first = q
        .resolve_review_item(id, ReviewAction::Merge, "alice", Some("same intake twice"))
        .unwrap();
    let ReviewItem::Duplicate(resolved) = &first else {
        panic!("expected a duplicate");
    };
    assert_eq!(resolved.status, ReviewStatus::Resolved);
    assert_eq!(resolved.reviewed_by.as_deref(), Some("alice"));
    assert_eq!(resolved.review_notes.as_deref(), Some("same intake twice"));
    assert!(resolved.reviewed_at.is_some());

    for action in [ReviewAction::Merge, ReviewAction::KeepSeparate, ReviewAction::Dismiss] {
        let err = q.resolve_review_item(id, action, "bob", Some("second look")).unwrap_err();
        assert!(err.is_already_resolved(), "{action}: {err}");
    }
    assert_eq!(stores.reviews.get_item(id).unwrap().unwrap(), first);
}

#[test]
fn unknown_item_is_not_found() {
    let stores = InMemoryStores::new();
    let err = queue(&stores, Duration::from_millis(50))
        .resolve_review_item(ReviewItemId::new(), ReviewAction::Reject, "alice", None)
        .unwrap_err();
    assert!(!err.is_already_resolved());
    assert!(err.to_string().contains("not found"), "{err}");
}

#[test]
fn batch_reports_partial_failures_and_commits_successes() {
    let stores = InMemoryStores::new();
    let q = queue(&stores, Duration::from_millis(200));
    let ids: Vec<ReviewItemId> = (0..5)
        .map(|i| file_pair(&stores, &format!("Person {i}"), &format!("Person {i}"), MatchTier::NameOnly).2)
        .collect();

    // Two of the five are already terminal.
    q.resolve_review_item(ids[1], ReviewAction::Dismiss, "alice", None).unwrap();
    q.resolve_review_item(ids[3], ReviewAction::KeepSeparate, "alice", None).unwrap();

    let outcome = q.batch_resolve(&ids, ReviewAction::Reject, "bob", Some("bulk cleanup"));
    assert_eq!(outcome.succeeded, 3);
    assert_eq!(outcome.failed, 2);
    assert!(outcome.failures.iter().all(|f| !f.retryable));

    for &id in [ids[0], ids[2], ids[4]].iter() {
        let item = stores.reviews.get_item(id).unwrap().unwrap();
        assert_eq!(item.resolution(), Some(ReviewResolution::Rejected));
    }
    let untouched = stores.reviews.get_item(ids[3]).unwrap().unwrap();
    assert_eq!(untouched.resolution(), Some(ReviewResolution::KeptSeparate));
}

#[test]
fn concurrent_reviewers_resolve_an_item_exactly_once() {
    let stores = InMemoryStores::new();
    let (a, b, id) = file_pair(&stores, "Ana Ruiz", "Ana Ruiz", MatchTier::NameOnly);
    let q = Arc::new(queue(&stores, Duration::from_secs(2)));

    let handles: Vec<_> = (0..4)
        .map(|n| {
            let q = Arc::clone(&q);
            thread::spawn(move || q.resolve_review_item(id, ReviewAction::Merge, &format!("reviewer-{n}"), None))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(err.is_already_resolved(), "{err}");
    }
    assert_eq!(stores.entities.canonical_id(b).unwrap(), stores.entities.canonical_id(a).unwrap());
}

#[test]
fn merge_racing_dismiss_leaves_consistent_state() {
    for _ in 0..20 {
        let stores = InMemoryStores::new();
        let (a, b, id) = file_pair(&stores, "Ana Ruiz", "Ana Ruiz", MatchTier::NameOnly);
        let q = Arc::new(queue(&stores, Duration::from_secs(2)));

        let handles: Vec<_> = [ReviewAction::Merge, ReviewAction::Dismiss]
            .into_iter()
            .map(|action| {
                let q = Arc::clone(&q);
                thread::spawn(move || q.resolve_review_item(id, action, "reviewer", None))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let merged = stores.entities.canonical_id(b).unwrap() == stores.entities.canonical_id(a).unwrap();
        match stores.reviews.get_item(id).unwrap().unwrap().resolution() {
            Some(ReviewResolution::Merged) => assert!(merged),
            Some(ReviewResolution::Rejected) => assert!(!merged),
            other => panic!("unexpected resolution {other:?}"),
        }
    }
}

#[test]
fn decision_approvals_racing_create_one_entity() {
    let stores = InMemoryStores::new();
    let existing = CandidateEntity::new("Jane Doe").with_email("jane@x.com");
    stores.entities.insert(existing).unwrap();
    let resolver = Resolver::in_memory(ResolutionConfig::default(), &stores).unwrap();
    let record = IncomingRecord::builder(SourceSystem::JotForm).email("jane@x.com").build();
    let decision = resolver.resolve(&record).unwrap();
    assert_eq!(decision.decision_type, DecisionType::ReviewPending);

    let q = Arc::new(ReviewQueue::for_resolver(&resolver));
    let handles: Vec<_> = [ReviewAction::Approve, ReviewAction::Approve, ReviewAction::Dismiss]
        .into_iter()
        .map(|action| {
            let q = Arc::clone(&q);
            let id = decision.decision_id;
            thread::spawn(move || q.resolve_review_item(id, action, "reviewer", None))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

    let approved = stores.reviews.get_item(decision.decision_id).unwrap().unwrap().resolution()
        == Some(ReviewResolution::KeptSeparate);
    assert_eq!(stores.entities.len(), if approved { 2 } else { 1 });
}

#[test]
fn busy_edit_lock_surfaces_unavailable() {
    let stores = InMemoryStores::new();
    let (a, b, id) = file_pair(&stores, "Ana Ruiz", "Ana Ruiz", MatchTier::NameOnly);
    let entities: Arc<dyn EntityStore> = stores.entities.clone();
    let _held = EditLock::acquire(entities.as_ref(), EntityPair::new(a, b), "import-job", Duration::from_millis(10))
        .unwrap();

    let err = queue(&stores, Duration::from_millis(30))
        .resolve_review_item(id, ReviewAction::Merge, "alice", None)
        .unwrap_err();
    assert!(err.is_unavailable());
    assert!(err.is_retryable());
    assert!(stores.reviews.get_item(id).unwrap().unwrap().is_pending());
    assert_ne!(stores.entities.canonical_id(a).unwrap(), stores.entities.canonical_id(b).unwrap());
}

#[test]
fn merge_closes_every_item_touching_the_pair() {
    let stores = InMemoryStores::new();
    let resolver = Resolver::in_memory(ResolutionConfig::default(), &stores).unwrap();

    let (a, b, id) = file_pair(&stores, "Ana Ruiz", "Ana Ruiz", MatchTier::NameOnly);
    stores
        .entities
        .update({
            let mut e = stores.entities.get(b).unwrap().unwrap();
            e.add_email("ana@x.com");
            e.version += 1;
            e
        })
        .unwrap();

    // A new record pointing at `b` lands in review on the exact-email floor.
    let record = IncomingRecord::builder(SourceSystem::Airtable).email("ana@x.com").build();
    let decision = resolver.resolve(&record).unwrap();
    assert_eq!(decision.decision_type, DecisionType::ReviewPending);
    assert_eq!(decision.top_candidate_entity_id, Some(b));

    let q = ReviewQueue::for_resolver(&resolver);
    q.resolve_review_item(id, ReviewAction::Merge, "alice", None).unwrap();

    assert!(stores.reviews.pending_referencing(a).unwrap().is_empty());
    assert!(stores.reviews.pending_referencing(b).unwrap().is_empty());
    let closed = stores.reviews.get_item(decision.decision_id).unwrap().unwrap();
    assert_eq!(closed.resolution(), Some(ReviewResolution::Superseded));
}

#[test]
fn listing_filters_and_counts_before_paging() {
    let stores = InMemoryStores::new();
    let existing = CandidateEntity::new("Jane Doe").with_email("jane@x.com");
    stores.entities.insert(existing).unwrap();
    let resolver = Resolver::in_memory(ResolutionConfig::default(), &stores).unwrap();
    for source in [SourceSystem::JotForm, SourceSystem::ClinicHq] {
        let record = IncomingRecord::builder(source).email("jane@x.com").build();
        resolver.resolve(&record).unwrap();
    }
    file_pair(&stores, "Ana Ruiz", "Ana Ruiz", MatchTier::NameOnly);
    file_pair(&stores, "Bo Li", "Bo Li", MatchTier::Email);

    let q = ReviewQueue::for_resolver(&resolver);
    let page = q.list_review_queue(&ReviewFilter::pending(), 1, 0).unwrap();
    assert_eq!(page.total, 4);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].tier(), Some(MatchTier::Email));
    assert_eq!(page.counts_by_tier_and_type.get("review_pending"), Some(&2));
    assert_eq!(page.counts_by_tier_and_type.get("tier_1"), Some(&1));

    let tail = q.list_review_queue(&ReviewFilter::pending(), 10, 2).unwrap();
    assert_eq!(tail.items.len(), 2);
    assert!(tail.items.iter().all(|i| i.kind() == ReviewKind::Decision));

    let jotform = q
        .list_review_queue(&ReviewFilter::pending().source_system(SourceSystem::JotForm), 10, 0)
        .unwrap();
    assert_eq!(jotform.total, 1);
}
