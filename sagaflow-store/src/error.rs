#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown event type `{0}`")]
    UnknownEventType(String),

    #[error("unknown accident kind `{0}`")]
    UnknownAccidentKind(String),

    #[error("unknown accident status `{0}`")]
    UnknownAccidentStatus(String),

    #[error("unknown config kind `{0}`")]
    UnknownConfigKind(String),

    #[error("accident `{0}` not found")]
    AccidentNotFound(i64),

    #[error("accident `{id}` cannot move from {from} to {to}")]
    AccidentStatusRegression {
        id: i64,
        from: crate::AccidentStatus,
        to: crate::AccidentStatus,
    },

    #[cfg(feature = "pg")]
    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
