use kanbot_store::StoreError;

/// Failures that escape the engine. Gateway and directory problems are
/// outcomes, not errors; only the store can fail an operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(StoreError::NotFound(_)))
    }
}
