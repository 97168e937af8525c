use thiserror::Error;

/// Authentication failure classes reported by the betting platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorCode {
    InvalidCredentials = 300,
    InvalidPassword = 301,
    UnknownError = 303,
}

#[derive(Debug, Error)]
pub enum VbetError {
    #[error("authentication failed for {username} [{}]", *code as u16)]
    InvalidUserAuthentication { username: String, code: AuthErrorCode },

    #[error("error getting hash {username} [{status}] {message}")]
    InvalidUserHash {
        username: String,
        status: u16,
        message: String,
    },

    #[error("user {0} not found in cache")]
    InvalidUserCache(String),

    #[error("user {0} is not running")]
    UnknownUser(String),

    #[error("invalid events response")]
    InvalidEvents,

    #[error("invalid results response {e_block_id:?} | {n} (retry {retry_count})")]
    InvalidResults {
        e_block_id: Option<u64>,
        n: i64,
        retry_count: u32,
    },

    #[error("invalid history response {e_block_id:?} | {n} (retry {retry_count})")]
    InvalidHistory {
        e_block_id: Option<u64>,
        n: i64,
        retry_count: u32,
    },
}
