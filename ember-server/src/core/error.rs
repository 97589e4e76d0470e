use thiserror::Error;

/// Errors surfaced by the store engine
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("value is not an integer or out of range")]
    NotAnInteger,

    #[error("DB index is out of range")]
    InvalidDbIndex,

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("READONLY You can't write against a read only replica.")]
    ReadOnlyReplica,
}

impl StoreError {
    /// Render as a RESP error line payload (without the leading '-')
    pub fn wire_message(&self) -> String {
        match self {
            StoreError::WrongType => self.to_string(),
            StoreError::ReadOnlyReplica => self.to_string(),
            other => format!("ERR {}", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
