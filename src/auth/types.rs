// Authentication types

use serde::{Deserialize, Serialize};

/// Which login/refresh contract the backend speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthBackend {
    /// JSON login at /api/v1/auth/login, JSON refresh at /api/oauth2/token/refresh
    CustomLogin,

    /// OAuth2 password grant, form-encoded against the token endpoint
    PasswordGrant,
}

impl AuthBackend {
    /// Parse the backend name used in configuration
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "custom" | "custom-login" | "json" => Some(AuthBackend::CustomLogin),
            "password-grant" | "password_grant" | "oauth2" => Some(AuthBackend::PasswordGrant),
            _ => None,
        }
    }
}

/// Access/refresh token pair as held in memory and in the credential store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
        }
    }

    /// Both halves present
    pub fn is_complete(&self) -> bool {
        self.access_token.is_some() && self.refresh_token.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

/// Token payload returned by login, refresh and the Google callback
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "tokenType")]
    pub token_type: Option<String>,
    #[serde(default, alias = "expiresIn")]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

/// User profile as reported by the backend
///
/// The backend is not consistent about casing, so both spellings are accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, alias = "user_id", alias = "userId")]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, alias = "first_name", rename = "firstName")]
    pub first_name: String,
    #[serde(default, alias = "last_name", rename = "lastName")]
    pub last_name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// What the session knows about the logged-in user
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileState {
    /// Nothing fetched yet
    Unknown,
    Loaded(UserProfile),
    /// Authenticated, but the profile could not be retrieved
    Unavailable { reason: String },
}

/// Externally visible session status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Anonymous,
    Authenticated,
    Refreshing,
}

/// Custom login request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest<'a> {
    pub username_or_email: &'a str,
    pub password: &'a str,
    pub remember_me: bool,
}

/// Custom refresh request body
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Google login-url response
#[derive(Deserialize)]
pub struct GoogleLoginUrlResponse {
    #[serde(alias = "authorizationUrl")]
    pub authorization_url: String,
}

/// Google callback exchange body
#[derive(Serialize)]
pub struct GoogleCallbackRequest<'a> {
    pub code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<&'a str>,
}

/// Account registration body
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub first_name: String,
    pub last_name: String,
}

/// Partial profile update; unset fields are left as they are
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none() && self.last_name.is_none() && self.email.is_none()
    }
}

/// Password change body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest<'a> {
    pub current_password: &'a str,
    pub new_password: &'a str,
}
