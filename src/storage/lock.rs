//! Entity edit locks.
//!
//! Merges and other entity edits hold the lock for the entities they touch
//! for the duration of the edit. A pair lock covers each of its two entities. The lock is released when `EditLock` is dropped,
//! including on early return through `?`.

use std::thread;
use std::time::{Duration, Instant};

use crate::entity::EntityPair;
use crate::error::{ResolutionError, ResolverResult};
use crate::storage::EntityStore;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Exclusive edit lock on the entities of a pair.
pub struct EditLock<'a> {
    store: &'a dyn EntityStore,
    pair: EntityPair,
    holder: String,
}

impl std::fmt::Debug for EditLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditLock")
            .field("pair", &self.pair)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl<'a> EditLock<'a> {
    /// Acquire the lock for `pair`, polling until `timeout` elapses.
    ///
    /// # Errors
    /// `ResolutionUnavailable` if another holder keeps the lock past `timeout`,
    /// or the store fails.
    pub fn acquire(
        store: &'a dyn EntityStore,
        pair: EntityPair,
        holder: impl Into<String>,
        timeout: Duration,
    ) -> ResolverResult<Self> {
        let holder = holder.into();
        let deadline = Instant::now() + timeout;
        loop {
            if store.try_lock(pair, &holder)? {
                return Ok(Self { store, pair, holder });
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    low = %pair.low(),
                    high = %pair.high(),
                    %holder,
                    "edit lock not acquired before timeout"
                );
                return Err(ResolutionError::unavailable(
                    None,
                    format!(
                        "edit lock for {}/{} busy for {}ms",
                        pair.low(),
                        pair.high(),
                        timeout.as_millis()
                    ),
                )
                .into());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// The locked pair.
    #[must_use]
    pub const fn pair(&self) -> EntityPair {
        self.pair
    }
}

impl Drop for EditLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.unlock(self.pair, &self.holder) {
            tracing::warn!(error = %e, holder = %self.holder, "failed to release edit lock");
        }
    }
}
