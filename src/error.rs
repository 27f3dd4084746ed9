// Error handling module
// Error types surfaced by the session client

use thiserror::Error;

use crate::auth::OAuthError;

/// Errors returned to callers of the session client
#[derive(Error, Debug)]
pub enum SessionError {
    /// Refresh failed; local credentials were cleared and the user must log in again
    #[error("Session expired, please log in again")]
    SessionExpired,

    /// Operation needs tokens but none are held
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Login or code exchange rejected
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Non-success response from the SmartDrive backend
    #[error("SmartDrive API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    /// Network-level failure talking to the backend
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Google OAuth2 flow failure
    #[error("Google login failed: {0}")]
    OAuth(#[from] OAuthError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Request validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SessionError {
    /// True when the caller should send the user back to the login surface
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            SessionError::SessionExpired | SessionError::NotAuthenticated
        )
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
