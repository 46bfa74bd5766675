use thiserror::Error;

/// Top-level error type for the entire proxy.
///
/// Variants group into the six kinds returned by [`ProxyError::kind`]; the
/// kind decides whether an error surfaces to the caller, deletes a pending
/// payout, or latches the adapter that produced it.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid user id: {0}")]
    InvalidUserId(String),

    #[error("unknown coin: {0}")]
    UnknownCoin(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    #[error("a pending payout already exists for this user")]
    PendingExists,

    #[error("could not reserve a unique deposit amount")]
    AmountCollision,

    #[error("insufficient backend balance: requested {requested}, available {available}")]
    InsufficientBackendBalance { requested: String, available: String },

    #[error("chain rpc error: {0}")]
    ChainRpc(String),

    #[error("malformed chain response: {0}")]
    MalformedResponse(String),

    #[error("rejected by chain: {0}")]
    ChainReject(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("adapter disabled by fatal error: {0}")]
    Latched(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Error taxonomy used for propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputValidation,
    StateConflict,
    AdapterTransient,
    AdapterReject,
    StorageFatal,
    ProgrammerError,
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::InvalidUserId(_)
            | ProxyError::UnknownCoin(_)
            | ProxyError::MethodNotFound(_)
            | ProxyError::InvalidRequest(_)
            | ProxyError::InvalidAddress(_)
            | ProxyError::InvalidAmount(_)
            | ProxyError::InvalidTag(_)
            | ProxyError::Config(_) => ErrorKind::InputValidation,
            ProxyError::PendingExists
            | ProxyError::AmountCollision
            | ProxyError::Latched(_)
            | ProxyError::InsufficientBackendBalance { .. } => ErrorKind::StateConflict,
            ProxyError::ChainRpc(_) | ProxyError::MalformedResponse(_) => {
                ErrorKind::AdapterTransient
            }
            ProxyError::ChainReject(_) => ErrorKind::AdapterReject,
            ProxyError::Storage(_) => ErrorKind::StorageFatal,
            ProxyError::Invariant(_) => ErrorKind::ProgrammerError,
        }
    }

    /// Whether this error must stick the adapter's fatal latch.
    ///
    /// AdapterReject intentionally does not latch: the pending row is deleted,
    /// a rejection event is emitted and processing continues.
    pub fn is_latching(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AdapterTransient | ErrorKind::StorageFatal | ErrorKind::ProgrammerError
        )
    }

    /// JSON-RPC 2.0 error code for this error.
    pub fn rpc_code(&self) -> i64 {
        match self {
            ProxyError::MethodNotFound(_) => -32601,
            ProxyError::InvalidRequest(_) => -32600,
            ProxyError::UnknownCoin(_) => -32004,
            ProxyError::Latched(_) => -32010,
            _ => match self.kind() {
                ErrorKind::InputValidation => -32602,
                ErrorKind::StateConflict => -32009,
                _ => -32603,
            },
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(error: reqwest::Error) -> Self {
        ProxyError::ChainRpc(format!("http request failed: {error}"))
    }
}

impl From<rust_decimal::Error> for ProxyError {
    fn from(error: rust_decimal::Error) -> Self {
        ProxyError::InvalidAmount(format!("decimal conversion failed: {error}"))
    }
}

/// Result type alias used throughout the crate.
pub type ProxyResult<T> = Result<T, ProxyError>;
