// Authentication module
// Token storage, refresh coordination and session lifecycle

mod backend;
mod claims;
mod coordinator;
mod credentials;
mod lifecycle;
mod manager;
mod oauth;
mod types;

pub use backend::{join_url, BackendEndpoints};
pub use claims::{decode_claims, DecodedClaims};
pub use coordinator::RefreshCoordinator;
pub use credentials::{CredentialStore, MemoryCredentialStore, SqliteCredentialStore};
pub use lifecycle::{spawn_refresh_task, RefreshTask};
pub use manager::{SessionManager, SessionSettings};
pub use oauth::{await_login_message, GoogleCallback, LoginMessage, OAuthError};
pub(crate) use types::ChangePasswordRequest;
pub use types::{
    AuthBackend, ProfileState, ProfileUpdate, RegisterRequest, SessionStatus, TokenPair,
    TokenResponse, UserProfile,
};
