use serde::{Deserialize, Serialize};

/// Per-stream state persisted between sync attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationState {
    /// Highest migration version applied to this stream's tables.
    #[serde(default)]
    pub version: u32,
    /// The final table must be rebuilt from the raw table before the next merge.
    #[serde(default)]
    pub needs_soft_reset: bool,
}

impl DestinationState {
    pub fn with_soft_reset(self, needs_soft_reset: bool) -> Self {
        Self {
            needs_soft_reset,
            ..self
        }
    }
}

/// A [`DestinationState`] and the store revision it was read at.
///
/// Revision `0` means nothing was stored yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionedState {
    pub state: DestinationState,
    pub revision: u64,
}

impl VersionedState {
    pub fn is_new(&self) -> bool {
        self.revision == 0
    }
}
