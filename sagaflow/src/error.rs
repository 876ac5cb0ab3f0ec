#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("store `{0}`")]
    Store(#[from] sagaflow_store::StoreError),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[error("dispatcher shut down")]
    DispatcherClosed,

    #[error("notification failed after {attempts} attempts: {reason}")]
    PermanentDelivery { attempts: u32, reason: String },

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
