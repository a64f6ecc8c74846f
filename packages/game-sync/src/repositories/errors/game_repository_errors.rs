#[derive(Debug, Clone, PartialEq)]
pub enum GameRepositoryError {
    NotFound,
    /// A write precondition failed: the row moved on since it was read.
    Conflict(String),
    /// The store refused the record itself.
    Rejected(String),
    Serialization(String),
    DynamoDb(String),
    Unavailable(String),
}

impl std::fmt::Display for GameRepositoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GameRepositoryError::NotFound => write!(f, "Game not found"),
            GameRepositoryError::Conflict(msg) => write!(f, "Write conflict: {}", msg),
            GameRepositoryError::Rejected(msg) => write!(f, "Rejected by store: {}", msg),
            GameRepositoryError::Serialization(msg) => {
                write!(f, "Serialization error: {}", msg)
            }
            GameRepositoryError::DynamoDb(msg) => write!(f, "DynamoDB error: {}", msg),
            GameRepositoryError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for GameRepositoryError {}
