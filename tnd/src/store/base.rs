use std::future::Future;

use crate::error::TndResult;
use crate::types::{DestinationState, StreamId, VersionedState};

/// Storage of [`DestinationState`]s, keyed by the declared stream identity.
///
/// Writes are compare-and-set on the revision returned by
/// [`DestinationStateStore::get_state`], so two runs racing on the same stream
/// cannot silently overwrite each other. Implementations must be safe to share
/// between stream workers.
pub trait DestinationStateStore {
    /// Returns the stored state, or a default one at revision `0` when the stream
    /// was never persisted.
    fn get_state(&self, stream: &StreamId) -> impl Future<Output = TndResult<VersionedState>> + Send;

    /// Stores `state` if the stored revision is still `expected_revision`.
    ///
    /// Returns the new revision. Fails with [`crate::error::ErrorKind::StateConflict`]
    /// when another writer stored a state in between.
    fn set_state(
        &self,
        stream: &StreamId,
        expected_revision: u64,
        state: DestinationState,
    ) -> impl Future<Output = TndResult<u64>> + Send;
}
