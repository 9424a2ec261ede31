use crate::validate::validate_new_replacement;
use crate::{
    Caller, Clock, CoreError, Replacement, ReplacementDraft, ReplacementId, ReplacementPatch,
    ReplacementStore, SyncFilter,
};

/// Application service orchestrating the replacement sync operations.
///
/// Generic over the store and the clock; every write is stamped with a single
/// `now` taken from the clock so `updated_at` and `deleted_at` agree.
pub struct ReplacementService<S: ReplacementStore, C: Clock> {
    store: S,
    clock: C,
}

impl<S: ReplacementStore, C: Clock> ReplacementService<S, C> {
    pub fn new(store: S, clock: C) -> Self {
        Self { store, clock }
    }

    /// List the caller's replacements for incremental sync.
    pub async fn list(
        &self,
        caller: &Caller,
        filter: &SyncFilter,
    ) -> Result<Vec<Replacement>, CoreError> {
        self.store.list(caller, filter).await
    }

    /// Validate and insert a new replacement.
    pub async fn create(
        &self,
        caller: &Caller,
        draft: ReplacementDraft,
    ) -> Result<Option<Replacement>, CoreError> {
        let new = validate_new_replacement(draft)?;
        self.store.insert(caller, new, self.clock.now()).await
    }

    /// Apply a partial update to one of the caller's replacements.
    pub async fn update(
        &self,
        caller: &Caller,
        id: &ReplacementId,
        patch: &ReplacementPatch,
    ) -> Result<Option<Replacement>, CoreError> {
        self.store.update(caller, id, patch, self.clock.now()).await
    }

    /// Mark one of the caller's replacements as deleted.
    pub async fn soft_delete(
        &self,
        caller: &Caller,
        id: &ReplacementId,
    ) -> Result<Option<Replacement>, CoreError> {
        let now = self.clock.now();
        let patch = ReplacementPatch::soft_delete(now);
        self.store.update(caller, id, &patch, now).await
    }
}
