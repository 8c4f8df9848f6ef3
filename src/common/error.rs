//! Error types for minizero

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Validation Errors ===
    #[error("No address provided for member {0}")]
    EmptyAddress(u64),

    #[error("Tablet predicate is empty (group {0})")]
    EmptyPredicate(u32),

    #[error("Group ID is zero for tablet {0}")]
    ZeroGroup(String),

    #[error("Invalid membership report: {0}")]
    InvalidReport(String),

    // === Conflict Errors ===
    #[error("Reusing RAFT index of a removed node: {0}")]
    ReusedId(u64),

    #[error("Duplicate Raft ID {id}: existing member at {addr} is still healthy")]
    DuplicateRaftId { id: u64, addr: String },

    #[error("Unknown cluster member {id} in group {group}")]
    UnknownMember { id: u64, group: u32 },

    #[error("No group with groupId {0} found")]
    UnknownGroup(u32),

    // === Consensus Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("Raft error: {0}")]
    Raft(String),

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Tablet {predicate} already served by group {group}")]
    TabletAlreadyServed { predicate: String, group: u32 },

    #[error("Consensus timeout")]
    ConsensusTimeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Server is being shut down")]
    ShutDown,

    #[error("Membership stream closed by subscriber")]
    StreamClosed,

    // === Storage Errors ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed(_)
                | Error::ConsensusTimeout
                | Error::NotLeader(_)
                | Error::Http(_)
        )
    }

    /// Proposals that lost a benign race against an identical claim.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Error::TabletAlreadyServed { .. })
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::EmptyAddress(_)
            | Error::EmptyPredicate(_)
            | Error::ZeroGroup(_)
            | Error::InvalidReport(_)
            | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::UnknownMember { .. } | Error::UnknownGroup(_) => StatusCode::NOT_FOUND,
            Error::ReusedId(_)
            | Error::DuplicateRaftId { .. }
            | Error::TabletAlreadyServed { .. } => StatusCode::CONFLICT,
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::ConsensusTimeout => StatusCode::REQUEST_TIMEOUT,
            Error::ShutDown | Error::ConnectionFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            Error::EmptyAddress(1).to_http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::ReusedId(3).to_http_status(), StatusCode::CONFLICT);
        assert_eq!(
            Error::UnknownGroup(9).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Raft("boom".into()).to_http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_benign_race() {
        let err = Error::TabletAlreadyServed {
            predicate: "name".into(),
            group: 2,
        };
        assert!(err.is_benign_race());
        assert!(!Error::Cancelled.is_benign_race());
        assert!(Error::NotLeader("2".into()).is_retryable());
    }
}
