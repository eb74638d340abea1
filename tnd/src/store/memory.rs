use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bail;
use crate::error::{ErrorKind, TndResult};
use crate::store::base::DestinationStateStore;
use crate::types::{DestinationState, StreamId, VersionedState};

type StreamKey = (String, String);

fn key(stream: &StreamId) -> StreamKey {
    (
        stream.original_namespace.clone(),
        stream.original_name.clone(),
    )
}

/// In-memory [`DestinationStateStore`]. Contents are lost when the process exits.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<HashMap<StreamKey, VersionedState>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a stored state, e.g. one left behind by an earlier engine version.
    pub async fn insert(&self, stream: &StreamId, state: DestinationState) -> u64 {
        let mut inner = self.inner.lock().await;
        let entry = inner.entry(key(stream)).or_default();
        entry.state = state;
        entry.revision += 1;

        entry.revision
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl DestinationStateStore for MemoryStateStore {
    async fn get_state(&self, stream: &StreamId) -> TndResult<VersionedState> {
        let inner = self.inner.lock().await;

        Ok(inner.get(&key(stream)).copied().unwrap_or_default())
    }

    async fn set_state(
        &self,
        stream: &StreamId,
        expected_revision: u64,
        state: DestinationState,
    ) -> TndResult<u64> {
        let mut inner = self.inner.lock().await;
        let entry = inner.entry(key(stream)).or_default();

        if entry.revision != expected_revision {
            bail!(
                ErrorKind::StateConflict,
                "Destination state was modified concurrently",
                format!(
                    "stream {stream} is at revision {}, expected {expected_revision}",
                    entry.revision
                )
            );
        }

        entry.state = state;
        entry.revision += 1;

        Ok(entry.revision)
    }
}
