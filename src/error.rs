#![forbid(unsafe_code)]

// Hub error kinds. Every variant maps onto an `{type: "error"}` frame sent
// to the offending connection; none of them mutate room state.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    /// A non-host issued a host-only event, or an asserted user id
    /// disagrees with the connection's authenticated identity.
    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("unknown room: {0}")]
    UnknownRoom(String),

    /// The event references state that does not exist or is not in the
    /// required phase (approving a non-pending user, signaling to a
    /// connection outside the room, ...).
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Internal(format!("serialization: {e}"))
    }
}

pub type HubResult<T> = Result<T, HubError>;
