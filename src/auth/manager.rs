use anyhow::Context;
use chrono::Utc;
use futures::FutureExt;
use reqwest::{Client, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use super::backend::{self, BackendEndpoints};
use super::claims::{decode_claims, DecodedClaims};
use super::coordinator::RefreshCoordinator;
use super::credentials::CredentialStore;
use super::oauth::GoogleCallback;
use super::types::{
    AuthBackend, GoogleCallbackRequest, GoogleLoginUrlResponse, ProfileState, SessionStatus,
    TokenPair, TokenResponse, UserProfile,
};
use crate::error::{Result, SessionError};

/// Everything the session needs to know about the backend
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub backend: AuthBackend,
    pub endpoints: BackendEndpoints,
    pub profile_path: String,
    pub logout_path: Option<String>,
    pub google_login_url_path: String,
    pub google_callback_path: String,

    /// Seconds before `exp` at which the token counts as near expiry
    pub refresh_threshold: i64,

    /// Upper bound on a single refresh call
    pub refresh_timeout: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl SessionSettings {
    /// Settings with the SmartDrive default paths against `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            backend: AuthBackend::CustomLogin,
            endpoints: BackendEndpoints {
                base_url: base_url.into(),
                login_path: "/api/v1/auth/login".to_string(),
                refresh_path: "/api/oauth2/token/refresh".to_string(),
                token_path: "/auth/oauth2/token".to_string(),
                client_id: None,
                client_secret: None,
            },
            profile_path: "/api/v1/users/profile".to_string(),
            logout_path: Some("/auth/api/v1/users/logout".to_string()),
            google_login_url_path: "/api/v1/auth/social/google/login-url".to_string(),
            google_callback_path: "/api/v1/auth/social/google/callback".to_string(),
            refresh_threshold: 300,
            refresh_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn url(&self, path: &str) -> String {
        self.endpoints.url(path)
    }
}

struct SessionInner {
    settings: SessionSettings,
    client: Client,
    store: Arc<dyn CredentialStore>,
    tokens: RwLock<TokenPair>,
    profile: RwLock<ProfileState>,
    coordinator: RefreshCoordinator,
    status: watch::Sender<SessionStatus>,
}

/// Session manager
/// Owns the token pair, the refresh coordinator and the session status.
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    /// Create the session, restoring any tokens left in `store`
    pub fn new(settings: SessionSettings, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .user_agent(backend::USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        let tokens = store.load();
        let status = if tokens.is_complete() {
            SessionStatus::Authenticated
        } else {
            SessionStatus::Anonymous
        };

        match (&tokens.access_token, status) {
            (Some(token), SessionStatus::Authenticated) => {
                match decode_claims(token) {
                    Some(claims) => tracing::info!(
                        "Restored session for {}",
                        claims
                            .username
                            .or(claims.email)
                            .or(claims.subject_id)
                            .unwrap_or_else(|| "unknown user".to_string())
                    ),
                    // The backend decides validity; keep the token and let a 401 sort it out
                    None => tracing::warn!("Restored session with an undecodable access token"),
                }
            }
            (Some(_), _) => {
                tracing::warn!("Stored access token has no refresh token, starting anonymous")
            }
            (None, _) => tracing::debug!("No stored session"),
        }

        let (status_tx, _) = watch::channel(status);

        Ok(Self {
            inner: Arc::new(SessionInner {
                settings,
                client,
                store,
                tokens: RwLock::new(tokens),
                profile: RwLock::new(ProfileState::Unknown),
                coordinator: RefreshCoordinator::new(),
                status: status_tx,
            }),
        })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// Shared HTTP client with connection pooling
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Follow session status changes
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    /// Both tokens held. Says nothing about their validity.
    pub async fn is_authenticated(&self) -> bool {
        self.inner.tokens.read().await.is_complete()
    }

    /// `Err(NotAuthenticated)` unless both tokens are held
    pub async fn require_authenticated(&self) -> Result<()> {
        if self.is_authenticated().await {
            Ok(())
        } else {
            Err(SessionError::NotAuthenticated)
        }
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner.tokens.read().await.access_token.clone()
    }

    pub async fn has_refresh_token(&self) -> bool {
        self.inner.tokens.read().await.refresh_token.is_some()
    }

    pub async fn tokens(&self) -> TokenPair {
        self.inner.tokens.read().await.clone()
    }

    /// Unverified claims of the current access token, for display
    pub async fn current_claims(&self) -> Option<DecodedClaims> {
        let tokens = self.inner.tokens.read().await;
        tokens.access_token.as_deref().and_then(decode_claims)
    }

    pub async fn is_near_expiry(&self) -> bool {
        self.is_near_expiry_at(Utc::now().timestamp()).await
    }

    /// Less than `refresh_threshold` seconds left at `now`.
    /// A token without readable `exp` never counts as near expiry.
    pub async fn is_near_expiry_at(&self, now: i64) -> bool {
        match self
            .current_claims()
            .await
            .and_then(|c| c.seconds_until_expiry(now))
        {
            Some(remaining) => remaining < self.inner.settings.refresh_threshold,
            None => false,
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.coordinator.is_refreshing()
    }

    /// Refresh the token pair, joining any refresh already in flight
    ///
    /// Returns true once a new pair is installed. On false the session the
    /// refresh started from has been torn down, or replaced by a newer login.
    pub async fn refresh(&self) -> bool {
        let inner = self.inner.clone();
        self.inner
            .coordinator
            .run(move || perform_refresh(inner).boxed())
            .await
    }

    /// Proactive refresh: only when near expiry and nothing is in flight.
    /// A failed proactive refresh ends the session.
    pub async fn refresh_if_needed(&self) -> bool {
        if self.is_refreshing() || !self.is_near_expiry().await {
            return false;
        }

        tracing::info!("Access token near expiry, refreshing proactively...");
        self.refresh().await
    }

    /// Persist and adopt a freshly issued pair
    pub async fn install_tokens(
        &self,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Result<()> {
        if refresh_token.is_none() {
            tracing::warn!("Backend issued no refresh token; session cannot be renewed");
        }

        let pair = TokenPair {
            access_token: Some(access_token),
            refresh_token,
        };

        // Held across the save so a concurrent teardown cannot interleave
        let mut tokens = self.inner.tokens.write().await;
        self.inner
            .store
            .save(&pair)
            .context("Failed to persist tokens")?;

        if pair
            .access_token
            .as_deref()
            .and_then(decode_claims)
            .is_none()
        {
            tracing::debug!("Access token is opaque, no claims available");
        }

        *tokens = pair;
        drop(tokens);
        self.inner.status.send_replace(SessionStatus::Authenticated);
        tracing::info!("Session established");
        Ok(())
    }

    /// Log in with the configured backend contract
    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
        remember_me: bool,
    ) -> Result<TokenResponse> {
        let settings = &self.inner.settings;
        let response = backend::login(
            &self.inner.client,
            settings.backend,
            &settings.endpoints,
            identifier,
            password,
            remember_me,
        )
        .await
        .map_err(|e| SessionError::AuthError(format!("{:#}", e)))?;

        self.install_tokens(response.access_token.clone(), response.refresh_token.clone())
            .await?;

        let profile = match &response.user {
            Some(user) => ProfileState::Loaded(user.clone()),
            None => ProfileState::Unknown,
        };
        self.set_profile(profile).await;

        Ok(response)
    }

    /// Ask the backend where to send the user for Google sign-in
    pub async fn google_login_url(&self, redirect_uri: Option<&str>) -> Result<String> {
        let mut url = Url::parse(&self.inner.settings.url(&self.inner.settings.google_login_url_path))
            .map_err(|e| SessionError::ConfigError(format!("Invalid Google login URL: {}", e)))?;
        if let Some(redirect_uri) = redirect_uri {
            url.query_pairs_mut().append_pair("redirectUri", redirect_uri);
        }

        let response = self.inner.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SessionError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body: GoogleLoginUrlResponse = response.json().await?;
        Ok(body.authorization_url)
    }

    /// Finish a Google sign-in from the parsed callback redirect
    ///
    /// Returns the user when the backend included one in its response.
    pub async fn complete_google_callback(
        &self,
        callback: GoogleCallback,
    ) -> Result<Option<UserProfile>> {
        match callback {
            GoogleCallback::Tokens {
                access_token,
                refresh_token,
            } => {
                tracing::info!("Google callback carried tokens directly");
                self.install_tokens(access_token, refresh_token).await?;
                self.set_profile(ProfileState::Unknown).await;
                Ok(None)
            }
            GoogleCallback::Code { code, state } => {
                tracing::info!("Exchanging Google authorization code...");
                let settings = &self.inner.settings;
                let response = self
                    .inner
                    .client
                    .post(settings.url(&settings.google_callback_path))
                    .json(&GoogleCallbackRequest {
                        code: &code,
                        state: state.as_deref(),
                    })
                    .send()
                    .await?;

                let tokens = backend::read_token_response(response, "Google callback")
                    .await
                    .map_err(|e| SessionError::AuthError(format!("{:#}", e)))?;

                self.install_tokens(tokens.access_token, tokens.refresh_token)
                    .await?;

                let profile = match &tokens.user {
                    Some(user) => ProfileState::Loaded(user.clone()),
                    None => ProfileState::Unknown,
                };
                self.set_profile(profile).await;
                Ok(tokens.user)
            }
        }
    }

    pub async fn profile(&self) -> ProfileState {
        self.inner.profile.read().await.clone()
    }

    pub async fn set_profile(&self, profile: ProfileState) {
        *self.inner.profile.write().await = profile;
    }

    /// Best-effort backend logout, then local teardown no matter what
    pub async fn logout(&self) {
        let token = self.access_token().await;
        if let (Some(path), Some(token)) = (self.inner.settings.logout_path.as_deref(), token) {
            let result = self
                .inner
                .client
                .post(self.inner.settings.url(path))
                .bearer_auth(token)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("Backend logout acknowledged")
                }
                Ok(response) => {
                    tracing::warn!("Backend logout returned {}", response.status())
                }
                Err(e) => tracing::warn!("Backend logout failed: {}", e),
            }
        }

        self.teardown("logout").await;
    }

    /// Drop every trace of the session locally
    pub async fn teardown(&self, reason: &str) {
        let mut tokens = self.inner.tokens.write().await;
        self.inner.clear_session(&mut tokens, reason).await;
    }
}

impl SessionInner {
    /// Clear memory, store and profile, then publish `Anonymous`.
    /// `tokens` is the held write guard of `self.tokens`.
    async fn clear_session(&self, tokens: &mut TokenPair, reason: &str) {
        *tokens = TokenPair::default();
        if let Err(e) = self.store.clear() {
            tracing::error!("Failed to clear stored tokens: {:#}", e);
        }
        *self.profile.write().await = ProfileState::Unknown;
        self.status.send_replace(SessionStatus::Anonymous);
        tracing::info!("Session ended: {}", reason);
    }

    /// End the session only if it still holds `spent`, the refresh token a
    /// failed refresh was sent with. A newer login is left alone.
    async fn end_session_holding(&self, spent: &str, reason: &str) {
        let mut tokens = self.tokens.write().await;
        if tokens.refresh_token.as_deref() == Some(spent) {
            self.clear_session(&mut tokens, reason).await;
        } else {
            tracing::info!("Session changed while refreshing, leaving it in place");
            self.publish_status_of(&tokens);
        }
    }

    /// Re-publish the status implied by `tokens`, overriding a stale `Refreshing`
    fn publish_status_of(&self, tokens: &TokenPair) {
        let status = if tokens.is_complete() {
            SessionStatus::Authenticated
        } else {
            SessionStatus::Anonymous
        };
        self.status.send_replace(status);
    }
}

/// One refresh round trip; only ever run through the coordinator
async fn perform_refresh(inner: Arc<SessionInner>) -> bool {
    let refresh_token = match inner.tokens.read().await.refresh_token.clone() {
        Some(token) => token,
        None => {
            tracing::warn!("No refresh token available");
            return false;
        }
    };

    inner.status.send_replace(SessionStatus::Refreshing);
    let settings = &inner.settings;

    let outcome = tokio::time::timeout(
        settings.refresh_timeout,
        backend::refresh(
            &inner.client,
            settings.backend,
            &settings.endpoints,
            &refresh_token,
        ),
    )
    .await;

    let response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::error!("Token refresh failed: {:#}", e);
            inner
                .end_session_holding(&refresh_token, "token refresh failed")
                .await;
            return false;
        }
        Err(_) => {
            tracing::error!("Token refresh timed out after {:?}", settings.refresh_timeout);
            inner
                .end_session_holding(&refresh_token, "token refresh timed out")
                .await;
            return false;
        }
    };

    let next_refresh_token = match response.refresh_token {
        Some(token) => token,
        None => {
            tracing::warn!("Refresh response had no refresh_token, keeping the current one");
            refresh_token.clone()
        }
    };

    let pair = TokenPair {
        access_token: Some(response.access_token),
        refresh_token: Some(next_refresh_token),
    };

    {
        let mut tokens = inner.tokens.write().await;
        // Logout, or logout followed by a new login, happened mid-flight
        if tokens.refresh_token.as_deref() != Some(refresh_token.as_str()) {
            tracing::info!("Session changed while refreshing, discarding new tokens");
            inner.publish_status_of(&tokens);
            return false;
        }

        // The old refresh token is spent either way, so keep the new pair in
        // memory even if it cannot be written out
        if let Err(e) = inner.store.save(&pair) {
            tracing::error!("Failed to persist refreshed tokens: {:#}", e);
        }
        *tokens = pair;
    }

    inner.status.send_replace(SessionStatus::Authenticated);
    tracing::info!("Token refresh successful");
    true
}
