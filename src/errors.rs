//! Typed error hierarchy for the storyteller service.
//!
//! Three concerns get their own types:
//! - `GitHubError` — upstream hosting-API failures, translated by status code
//! - `AdmissionError` — push-channel capacity rejections
//! - `AuthError` — token issuance and verification failures
//!
//! Rate-limit rejection of a connection attempt is a policy violation
//! rather than a capacity problem, so it gets its own type.

use thiserror::Error;

/// Errors raised by the GitHub API client.
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("Authentication failed or forbidden: {message}")]
    Auth { message: String, status: u16 },

    #[error("GitHub API rate limit exceeded. Resets at {reset_time}.")]
    RateLimit { reset_time: i64, status: u16 },

    #[error("GitHub resource not found: {message}")]
    NotFound { message: String },

    #[error("GitHub API error: {message}")]
    Api { message: String, status: Option<u16> },

    #[error("GitHub request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Capacity rejection when admitting a new push channel.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Server is at maximum capacity.")]
    ServerFull,

    #[error("Too many connections for this user.")]
    UserLimit,
}

/// Policy-violation rejection from the connect rate limiter.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Too many connection attempts. Please wait {retry_after_secs} seconds.")]
pub struct RateLimitExceeded {
    pub retry_after_secs: u64,
}

/// Errors from token issuance and verification.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Could not validate credentials")]
    InvalidToken,

    #[error("Token has expired")]
    Expired,

    #[error("Failed to issue token: {0}")]
    Issue(#[from] jsonwebtoken::errors::Error),
}
