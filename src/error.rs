use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum AnalystError {
    DatabaseError(String),
    StateTransitionError(String),
    SchedulingError(String),
    CredentialError(String),
    ValidationError(String),
    ConfigurationError(String),
}

impl fmt::Display for AnalystError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalystError::DatabaseError(msg) => write!(f, "Database error: {msg}"),
            AnalystError::StateTransitionError(msg) => write!(f, "State transition error: {msg}"),
            AnalystError::SchedulingError(msg) => write!(f, "Scheduling error: {msg}"),
            AnalystError::CredentialError(msg) => write!(f, "Credential error: {msg}"),
            AnalystError::ValidationError(msg) => write!(f, "Validation error: {msg}"),
            AnalystError::ConfigurationError(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for AnalystError {}

impl From<sqlx::Error> for AnalystError {
    fn from(err: sqlx::Error) -> Self {
        AnalystError::DatabaseError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AnalystError>;
