#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The analyzer cannot classify the statement. The forward statement
    /// still runs, without compensation coverage.
    #[error("unsupported statement: {0}")]
    UnsupportedStatement(String),

    #[error("sql parse `{0}`")]
    SqlParse(#[from] sqlparser::parser::ParserError),

    /// The row(s) touched by an insert cannot be identified for deletion.
    #[error("cannot resolve compensation key: {0}")]
    KeyResolution(String),

    #[error("before image read failed: {0}")]
    BeforeImageRead(String),

    #[error("local transaction already {0}")]
    TxClosed(&'static str),

    #[error("event delivery failed after {attempts} attempts: {reason}")]
    PermanentDelivery { attempts: u32, reason: String },

    #[error("executor `{0}`")]
    Executor(String),

    #[error("store `{0}`")]
    Store(#[from] sagaflow_store::StoreError),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[cfg(feature = "pg")]
    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
