use std::io;

use thiserror::Error;

/// A rejected chat command. The `Display` text is what the offending session
/// receives after `ERROR:`; no other session ever sees it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Username cannot be empty")]
    EmptyName,
    #[error("Username cannot contain ':' or ','")]
    InvalidName,
    #[error("Username already taken")]
    NameTaken,
    #[error("Username SERVER is reserved")]
    ReservedName,
    #[error("Already logged in")]
    AlreadyLoggedIn,
    #[error("Login first")]
    NotLoggedIn,
    #[error("Room name cannot be empty")]
    EmptyRoom,
    #[error("Room name cannot contain ':'")]
    InvalidRoom,
    #[error("Not in any room")]
    NotInRoom,
    #[error("Must join a room first")]
    MustJoinRoom,
    #[error("PM format PM:target:message")]
    MalformedPrivateMessage,
    #[error("Recipient not found")]
    RecipientNotFound,
    #[error("Unknown command")]
    UnknownCommand,
}

/// Failure on the file-exchange channel.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("no file with id '{0}'")]
    NotFound(String),
    #[error("upload ended after {received} of {expected} bytes")]
    Incomplete { expected: u64, received: u64 },
    #[error("storage failure: {0}")]
    Storage(#[from] io::Error),
}

impl TransferError {
    /// Short code sent to the peer as `ERROR:<code>`.
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::BadRequest(_) => "BadRequest",
            TransferError::NotFound(_) => "NotFound",
            TransferError::Incomplete { .. } => "Incomplete",
            TransferError::Storage(_) => "StorageFailure",
        }
    }
}
