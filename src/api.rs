// Typed SmartDrive API calls on top of the session client

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

use crate::auth::{
    ChangePasswordRequest, GoogleCallback, ProfileState, ProfileUpdate, RegisterRequest,
    SessionManager, UserProfile,
};
use crate::error::{Result, SessionError};
use crate::http_client::{ApiRequest, MultipartField, SessionHttpClient};

const REGISTER_PATH: &str = "/api/v1/users/register";
const VERIFY_EMAIL_PATH: &str = "/api/v1/users/verify-email";
const CHANGE_PASSWORD_PATH: &str = "/api/v1/users/change-password";

/// Decoded response plus the status it came with
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
    pub data: T,
    pub status: u16,
    pub success: bool,
}

/// High level client used by the CLI and embedding applications
#[derive(Clone)]
pub struct SmartDriveClient {
    http: SessionHttpClient,
}

impl SmartDriveClient {
    pub fn new(session: SessionManager) -> Self {
        Self {
            http: SessionHttpClient::new(session),
        }
    }

    pub fn session(&self) -> &SessionManager {
        self.http.session()
    }

    pub fn http(&self) -> &SessionHttpClient {
        &self.http
    }

    /// Send a request and decode the body
    ///
    /// Error statuses come back as `success: false`; an empty or non-JSON
    /// body decodes to `T::default()`.
    pub async fn send<T>(&self, request: ApiRequest) -> Result<ApiResponse<T>>
    where
        T: DeserializeOwned + Default,
    {
        let response = self.http.execute(&request).await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        let data = if bytes.is_empty() {
            T::default()
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::debug!("Response body from {} is not the expected JSON: {}", request.path, e);
                T::default()
            })
        };

        Ok(ApiResponse {
            data,
            status: status.as_u16(),
            success: status.is_success(),
        })
    }

    pub async fn get_json<T>(&self, path: &str) -> Result<ApiResponse<T>>
    where
        T: DeserializeOwned + Default,
    {
        self.send(ApiRequest::get(path)).await
    }

    pub async fn post_json<T, B>(&self, path: &str, body: &B) -> Result<ApiResponse<T>>
    where
        T: DeserializeOwned + Default,
        B: Serialize + ?Sized,
    {
        self.send(ApiRequest::post(path).json(to_json(body)?)).await
    }

    pub async fn put_json<T, B>(&self, path: &str, body: &B) -> Result<ApiResponse<T>>
    where
        T: DeserializeOwned + Default,
        B: Serialize + ?Sized,
    {
        self.send(ApiRequest::put(path).json(to_json(body)?)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse<Value>> {
        self.send(ApiRequest::delete(path)).await
    }

    /// Upload a file as multipart form data, with optional JSON metadata
    pub async fn upload_file(
        &self,
        path: &str,
        file: &Path,
        metadata: Option<&Value>,
    ) -> Result<ApiResponse<Value>> {
        let bytes = tokio::fs::read(file).await.map_err(|e| {
            SessionError::ValidationError(format!("Cannot read {}: {}", file.display(), e))
        })?;
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let mut fields = vec![MultipartField::File {
            name: "file".to_string(),
            file_name,
            bytes,
            mime: None,
        }];
        if let Some(metadata) = metadata {
            fields.push(MultipartField::Text {
                name: "metadata".to_string(),
                value: metadata.to_string(),
            });
        }

        tracing::info!("Uploading {} to {}", file.display(), path);
        self.send(ApiRequest::post(path).multipart(fields)).await
    }

    /// Fetch the profile and record the outcome on the session
    ///
    /// Failure is recorded as `ProfileState::Unavailable`; no placeholder
    /// user is made up.
    pub async fn fetch_profile(&self) -> Result<UserProfile> {
        let path = self.session().settings().profile_path.clone();
        let result = self.http.execute(&ApiRequest::get(path)).await;

        let outcome = match result {
            Ok(response) if response.status().is_success() => response
                .json::<UserProfile>()
                .await
                .map_err(SessionError::Transport),
            Ok(response) => {
                let status = response.status().as_u16();
                let message = response.text().await.unwrap_or_default();
                Err(SessionError::ApiError { status, message })
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(profile) => {
                self.session()
                    .set_profile(ProfileState::Loaded(profile.clone()))
                    .await;
                Ok(profile)
            }
            Err(e) => {
                if !e.requires_login() {
                    tracing::warn!("Failed to load user profile: {}", e);
                    self.session()
                        .set_profile(ProfileState::Unavailable {
                            reason: e.to_string(),
                        })
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Log in, then make sure the profile is known or explicitly unavailable
    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
        remember_me: bool,
    ) -> Result<ProfileState> {
        self.session().login(identifier, password, remember_me).await?;
        self.ensure_profile().await
    }

    /// Complete a Google sign-in, then load the profile if the backend sent none
    pub async fn complete_google_callback(&self, callback: GoogleCallback) -> Result<ProfileState> {
        self.session().complete_google_callback(callback).await?;
        self.ensure_profile().await
    }

    pub async fn logout(&self) {
        self.session().logout().await;
    }

    /// Create an account. Does not log in.
    pub async fn register(&self, account: &RegisterRequest) -> Result<Value> {
        if account.password != account.confirm_password {
            return Err(SessionError::ValidationError(
                "Passwords do not match".to_string(),
            ));
        }
        let body = to_json(account)?;
        tracing::info!("Registering account {}", account.username);
        self.checked(ApiRequest::post(REGISTER_PATH).json(body), "Registration failed")
            .await
    }

    /// Confirm an email address with the token from the verification link
    pub async fn verify_email(&self, token: &str) -> Result<()> {
        if token.trim().is_empty() {
            return Err(SessionError::ValidationError(
                "No verification token found".to_string(),
            ));
        }
        self.checked(
            ApiRequest::get(VERIFY_EMAIL_PATH).query("token", token),
            "Email verification failed",
        )
        .await?;
        Ok(())
    }

    /// Update the signed-in user's profile and adopt what the backend returns
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile> {
        self.session().require_authenticated().await?;
        if update.is_empty() {
            return Err(SessionError::ValidationError(
                "Nothing to update".to_string(),
            ));
        }

        let path = self.session().settings().profile_path.clone();
        let data = self
            .checked(ApiRequest::put(path).json(to_json(update)?), "Profile update failed")
            .await?;
        let profile: UserProfile = serde_json::from_value(data).map_err(|e| {
            SessionError::Internal(anyhow::anyhow!("Unexpected profile response: {}", e))
        })?;

        self.session()
            .set_profile(ProfileState::Loaded(profile.clone()))
            .await;
        Ok(profile)
    }

    pub async fn change_password(&self, current_password: &str, new_password: &str) -> Result<()> {
        self.session().require_authenticated().await?;
        let body = to_json(&ChangePasswordRequest {
            current_password,
            new_password,
        })?;
        self.checked(
            ApiRequest::post(CHANGE_PASSWORD_PATH).json(body),
            "Password change failed",
        )
        .await?;
        tracing::info!("Password changed");
        Ok(())
    }

    /// Send `request`; a non-success status becomes `SessionError::ApiError`
    /// carrying the backend's `message` (or `error`), else `fallback`
    async fn checked(&self, request: ApiRequest, fallback: &str) -> Result<Value> {
        let response: ApiResponse<Value> = self.send(request).await?;
        if response.success {
            return Ok(response.data);
        }

        let message = response
            .data
            .get("message")
            .or_else(|| response.data.get("error"))
            .and_then(Value::as_str)
            .unwrap_or(fallback)
            .to_string();
        Err(SessionError::ApiError {
            status: response.status,
            message,
        })
    }

    async fn ensure_profile(&self) -> Result<ProfileState> {
        if self.session().profile().await == ProfileState::Unknown {
            match self.fetch_profile().await {
                Ok(_) => {}
                Err(e) if e.requires_login() => return Err(e),
                // Logged in regardless; the failure is recorded on the session
                Err(_) => {}
            }
        }
        Ok(self.session().profile().await)
    }
}

fn to_json<B: Serialize + ?Sized>(body: &B) -> Result<Value> {
    serde_json::to_value(body)
        .map_err(|e| SessionError::ValidationError(format!("Unserializable body: {}", e)))
}
