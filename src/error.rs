#[derive(thiserror::Error, Debug)]
pub enum CustodyError {
    #[error("{0}")]
    Precondition(String),
    #[error("{0}")]
    Policy(String),
    #[error("{0}")]
    InsufficientStock(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("audit ledger is append-only; entry {seq} for {target} is already recorded")]
    AppendOnly { target: String, seq: u64 },
    #[error("audit chain broken for {target} at entry {seq}")]
    ChainBroken { target: String, seq: u64 },
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("encoding error: {0}")]
    Encoding(String),
}
