//! Tiered duplicate scanning over resolved entities.
//!
//! Real-time resolution only compares a record against candidates retrieved
//! for it. Entities created before a corroborating signal arrived can still
//! describe the same person, so a periodic sweep blocks the whole store,
//! compares pairs within each block and files suspected duplicates into the
//! review queue, keyed by unordered pair and tier.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DedupPolicy;
use crate::entity::{CandidateEntity, EntityId, EntityPair};
use crate::error::{ResolverResult, ValidationError};
use crate::normalize::trigrams;
use crate::review::{ReviewItemId, ReviewResolution, ReviewStatus};
use crate::scoring::name_similarity;
use crate::storage::{EntityStore, ReviewStore, UpsertOutcome};

const DUPLICATE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93d7_4b58_a0e2_5c8d_17b3_f940);

/// Strength of the evidence linking a duplicate pair, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MatchTier {
    /// Identical email.
    Email,
    /// Identical phone.
    Phone,
    /// Similar name at the same address.
    NameAddress,
    /// Similar name in the same area code.
    NameAreaCode,
    /// Very similar name, nothing else.
    NameOnly,
}

impl MatchTier {
    /// All tiers, strongest first.
    pub const ALL: [Self; 5] = [
        Self::Email,
        Self::Phone,
        Self::NameAddress,
        Self::NameAreaCode,
        Self::NameOnly,
    ];

    /// Tier number, 1 (strongest) to 5.
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Email => 1,
            Self::Phone => 2,
            Self::NameAddress => 3,
            Self::NameAreaCode => 4,
            Self::NameOnly => 5,
        }
    }
}

impl TryFrom<u8> for MatchTier {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Email),
            2 => Ok(Self::Phone),
            3 => Ok(Self::NameAddress),
            4 => Ok(Self::NameAreaCode),
            5 => Ok(Self::NameOnly),
            other => Err(ValidationError::InvalidConfig {
                reason: format!("match tier must be 1..=5, got {other}"),
            }),
        }
    }
}

impl From<MatchTier> for u8 {
    fn from(value: MatchTier) -> Self {
        value.number()
    }
}

impl fmt::Display for MatchTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {}", self.number())
    }
}

/// A suspected duplicate pair awaiting review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupCandidate {
    /// Deterministic id of (pair, tier).
    pub duplicate_id: ReviewItemId,
    /// Side that survives a merge.
    pub canonical_entity_id: EntityId,
    /// Side merged away.
    pub candidate_entity_id: EntityId,
    /// Evidence tier.
    pub match_tier: MatchTier,
    /// The value the pair shares (email, phone, address, area code or name key).
    pub shared_signal: String,
    /// Similarity in [0, 1].
    pub similarity_score: f64,
    /// Lifecycle status.
    pub status: ReviewStatus,
    /// First detection.
    pub detected_at: DateTime<Utc>,
    /// Last scan that saw the pair.
    pub last_scanned_at: DateTime<Utc>,

    /// When a reviewer resolved the pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Who resolved the pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    /// Reviewer notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<String>,
    /// Terminal outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ReviewResolution>,
}

impl DedupCandidate {
    /// Deterministic id for an unordered pair and tier.
    #[must_use]
    pub fn id_for(pair: EntityPair, tier: MatchTier) -> ReviewItemId {
        let name = format!("{}:{}:{}", pair.low(), pair.high(), tier.number());
        ReviewItemId::from_uuid(Uuid::new_v5(&DUPLICATE_NAMESPACE, name.as_bytes()))
    }

    /// Creates a pending candidate.
    #[must_use]
    pub fn new(
        canonical: EntityId,
        candidate: EntityId,
        tier: MatchTier,
        shared_signal: impl Into<String>,
        similarity: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            duplicate_id: Self::id_for(EntityPair::new(canonical, candidate), tier),
            canonical_entity_id: canonical,
            candidate_entity_id: candidate,
            match_tier: tier,
            shared_signal: shared_signal.into(),
            similarity_score: similarity.clamp(0.0, 1.0),
            status: ReviewStatus::Pending,
            detected_at: now,
            last_scanned_at: now,
            reviewed_at: None,
            reviewed_by: None,
            review_notes: None,
            resolution: None,
        }
    }

    /// The unordered pair.
    #[must_use]
    pub fn pair(&self) -> EntityPair {
        EntityPair::new(self.canonical_entity_id, self.candidate_entity_id)
    }
}

/// Summary of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Pairs compared.
    pub pairs_examined: usize,
    /// New pending rows.
    pub inserted: usize,
    /// Pending rows whose similarity changed.
    pub updated: usize,
    /// Rows left as they were (same similarity, or already resolved).
    pub unchanged: usize,
    /// Pairs skipped because a reviewer kept them separate.
    pub suppressed: usize,
    /// Duplicate pairs found per tier number.
    pub by_tier: BTreeMap<u8, usize>,
    /// True if nothing was written.
    pub dry_run: bool,
}

impl ScanReport {
    /// Count of new or updated candidates.
    #[must_use]
    pub const fn new_or_updated(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Strongest tier a pair qualifies for, with its shared signal and similarity.
fn classify_pair(a: &CandidateEntity, b: &CandidateEntity, policy: &DedupPolicy) -> Option<(MatchTier, String, f64)> {
    if let Some(email) = a.emails.iter().find(|e| b.emails.contains(e)) {
        return Some((MatchTier::Email, email.clone(), 1.0));
    }
    if let Some(phone) = a.phones.iter().find(|p| b.phones.contains(p)) {
        return Some((MatchTier::Phone, phone.clone(), 1.0));
    }

    // Name tiers need a name on both sides.
    let (Some(key_a), Some(key_b)) = (a.name_key(), b.name_key()) else {
        return None;
    };
    let sim = name_similarity(&key_a, &key_b);
    if sim >= policy.name_threshold {
        if let (Some(addr_a), Some(addr_b)) = (&a.address, &b.address) {
            if addr_a == addr_b {
                return Some((MatchTier::NameAddress, addr_a.clone(), sim));
            }
        }
        let codes_b: BTreeSet<&str> = b.area_codes().collect();
        if let Some(code) = a.area_codes().find(|c| codes_b.contains(c)) {
            return Some((MatchTier::NameAreaCode, code.to_string(), sim));
        }
    }
    if sim >= policy.name_only_threshold {
        return Some((MatchTier::NameOnly, key_a, sim));
    }
    None
}

/// Canonical side first: older `created_at`, then smaller id.
fn order_pair<'a>(a: &'a CandidateEntity, b: &'a CandidateEntity) -> (&'a CandidateEntity, &'a CandidateEntity) {
    let a_first = a
        .created_at
        .cmp(&b.created_at)
        .then_with(|| a.entity_id.cmp(&b.entity_id))
        .is_le();
    if a_first {
        (a, b)
    } else {
        (b, a)
    }
}

/// Periodic batch sweep for missed duplicates.
pub struct DedupScanner {
    entities: Arc<dyn EntityStore>,
    reviews: Arc<dyn ReviewStore>,
    policy: DedupPolicy,
}

impl fmt::Debug for DedupScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupScanner")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl DedupScanner {
    /// Creates a scanner over the given stores.
    #[must_use]
    pub fn new(entities: Arc<dyn EntityStore>, reviews: Arc<dyn ReviewStore>, policy: DedupPolicy) -> Self {
        Self {
            entities,
            reviews,
            policy,
        }
    }

    /// Runs a scan and returns the number of new or updated candidates.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn run_dedup_scan(&self, tier_filter: Option<MatchTier>) -> ResolverResult<usize> {
        self.run(tier_filter, false).map(|r| r.new_or_updated())
    }

    /// Runs a scan, optionally without writing.
    ///
    /// With `tier_filter`, only pairs whose strongest tier is that tier are
    /// filed.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn run(&self, tier_filter: Option<MatchTier>, dry_run: bool) -> ResolverResult<ScanReport> {
        let mut entities = self.entities.list_all()?;
        entities.sort_by_key(|e| e.entity_id);

        let pairs = self.candidate_pairs(&entities);
        let now = Utc::now();
        let mut report = ScanReport {
            dry_run,
            ..ScanReport::default()
        };

        for (i, j) in pairs {
            report.pairs_examined += 1;
            let (canonical, candidate) = order_pair(&entities[i], &entities[j]);
            let Some((tier, shared, sim)) = classify_pair(canonical, candidate, &self.policy) else {
                continue;
            };
            if tier_filter.is_some_and(|t| t != tier) {
                continue;
            }
            let pair = EntityPair::new(canonical.entity_id, candidate.entity_id);
            if self.reviews.is_suppressed(pair)? {
                report.suppressed += 1;
                continue;
            }

            let mut row = DedupCandidate::new(canonical.entity_id, candidate.entity_id, tier, shared, sim);
            row.detected_at = now;
            row.last_scanned_at = now;

            let outcome = if dry_run {
                self.preview(&row)?
            } else {
                self.reviews.upsert_duplicate(row)?
            };
            match outcome {
                UpsertOutcome::Inserted => report.inserted += 1,
                UpsertOutcome::Updated => report.updated += 1,
                UpsertOutcome::Unchanged => report.unchanged += 1,
            }
            *report.by_tier.entry(tier.number()).or_default() += 1;
        }

        tracing::info!(
            entities = entities.len(),
            pairs_examined = report.pairs_examined,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            suppressed = report.suppressed,
            dry_run,
            "dedup scan complete"
        );
        Ok(report)
    }

    fn preview(&self, row: &DedupCandidate) -> ResolverResult<UpsertOutcome> {
        Ok(match self.reviews.get_duplicate(row.duplicate_id)? {
            None => UpsertOutcome::Inserted,
            Some(existing) if existing.status == ReviewStatus::Pending
                && existing.similarity_score.total_cmp(&row.similarity_score).is_ne() =>
            {
                UpsertOutcome::Updated
            }
            Some(_) => UpsertOutcome::Unchanged,
        })
    }

    /// Index pairs (i < j) sharing at least one blocking key.
    ///
    /// Exact-identifier blocks are always expanded. Fuzzy blocks (address,
    /// area code + initial, name trigram) larger than `max_block_size` are
    /// skipped: a key that common carries no evidence.
    fn candidate_pairs(&self, entities: &[CandidateEntity]) -> BTreeSet<(usize, usize)> {
        let mut exact: HashMap<String, Vec<usize>> = HashMap::new();
        let mut fuzzy: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, e) in entities.iter().enumerate() {
            for email in &e.emails {
                exact.entry(format!("e:{email}")).or_default().push(idx);
            }
            for phone in &e.phones {
                exact.entry(format!("p:{phone}")).or_default().push(idx);
            }
            let key = e.name_key().unwrap_or_default();
            if let Some(address) = &e.address {
                fuzzy.entry(format!("a:{address}")).or_default().push(idx);
            }
            if let Some(initial) = key.chars().next() {
                for code in e.area_codes() {
                    fuzzy.entry(format!("c:{code}:{initial}")).or_default().push(idx);
                }
            }
            for gram in trigrams(&key) {
                fuzzy.entry(format!("n:{gram}")).or_default().push(idx);
            }
        }

        let mut pairs = BTreeSet::new();
        let mut expand = |members: &[usize]| {
            for (pos, &i) in members.iter().enumerate() {
                for &j in &members[pos + 1..] {
                    if i != j {
                        pairs.insert((i.min(j), i.max(j)));
                    }
                }
            }
        };
        for members in exact.values() {
            expand(members);
        }
        for (key, members) in &fuzzy {
            if members.len() > self.policy.max_block_size {
                tracing::debug!(block = %key, size = members.len(), "skipping oversized block");
                continue;
            }
            expand(members);
        }
        pairs
    }
}
