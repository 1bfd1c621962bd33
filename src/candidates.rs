//! Candidate retrieval.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::entity::{CandidateEntity, EntityId};
use crate::error::ResolverResult;
use crate::normalize::NormalizedSignals;
use crate::storage::EntityStore;

/// Retrieves a bounded set of plausible existing entities for a record.
///
/// Each present signal contributes at most `per_signal` entities: exact
/// lookups for email and phone, trigram lookup for the name, and exact
/// lookup for the canonical address. Results are unioned in that order and
/// deduplicated by entity id, keeping the first occurrence.
pub struct CandidateFinder {
    entities: Arc<dyn EntityStore>,
    per_signal: usize,
}

impl fmt::Debug for CandidateFinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateFinder")
            .field("per_signal", &self.per_signal)
            .finish_non_exhaustive()
    }
}

impl CandidateFinder {
    /// Creates a finder returning up to `per_signal` entities per signal type.
    #[must_use]
    pub fn new(entities: Arc<dyn EntityStore>, per_signal: usize) -> Self {
        Self {
            entities,
            per_signal: per_signal.max(1),
        }
    }

    /// Finds candidates for `signals`. An empty result is not an error.
    ///
    /// # Errors
    /// Store failures; connection failures and timeouts surface as
    /// `ResolutionUnavailable`.
    pub fn find(&self, signals: &NormalizedSignals) -> ResolverResult<Vec<CandidateEntity>> {
        self.collect(signals, None)
    }

    /// Like [`find`](Self::find), but never returns entity `excluded`.
    ///
    /// The excluded entity does not use up any signal's budget.
    ///
    /// # Errors
    /// Same as [`find`](Self::find).
    pub fn find_excluding(
        &self,
        signals: &NormalizedSignals,
        excluded: EntityId,
    ) -> ResolverResult<Vec<CandidateEntity>> {
        self.collect(signals, Some(excluded))
    }

    fn collect(&self, signals: &NormalizedSignals, excluded: Option<EntityId>) -> ResolverResult<Vec<CandidateEntity>> {
        let k = self.per_signal;
        let fetch = if excluded.is_some() { k + 1 } else { k };
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut push_all = |found: Vec<CandidateEntity>| {
            let kept = found
                .into_iter()
                .filter(|e| Some(e.entity_id) != excluded)
                .take(k);
            for entity in kept {
                if seen.insert(entity.entity_id) {
                    out.push(entity);
                }
            }
        };

        if let Some(email) = &signals.email {
            push_all(self.entities.find_by_email(email, fetch)?);
        }
        if let Some(phone) = &signals.phone {
            push_all(self.entities.find_by_phone(phone, fetch)?);
        }
        if let Some(name) = &signals.name {
            push_all(self.entities.find_by_name_fuzzy(&name.key, fetch)?);
        }
        if let Some(address) = &signals.address {
            push_all(self.entities.find_by_address(address, fetch)?);
        }

        tracing::debug!(candidates = out.len(), "retrieved candidates");
        Ok(out)
    }
}
