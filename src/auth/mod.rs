#![forbid(unsafe_code)]

// Identity resolution for incoming connections. The hub trusts only the
// identity bound here; user fields asserted inside client frames are
// checked against it, never believed on their own.

pub mod jwt;

/// Authenticated identity attached to a connection at upgrade time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    /// Builds an identity with the uniform user-id normalization applied:
    /// whitespace-trimmed, case-preserving.
    pub fn new(user_id: &str, display_name: &str) -> Self {
        Self {
            user_id: user_id.trim().to_string(),
            display_name: display_name.trim().to_string(),
        }
    }

    /// True when an asserted user id names this identity, under the same
    /// normalization used for all admission and transcript bookkeeping.
    pub fn matches(&self, asserted_user_id: &str) -> bool {
        self.user_id == asserted_user_id.trim()
    }
}

/// Normalizes a user id the same way `Identity::new` does.
pub fn normalize_user_id(user_id: &str) -> &str {
    user_id.trim()
}
