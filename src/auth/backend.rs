// Login and refresh calls for each backend contract

use anyhow::{Context, Result};
use reqwest::Client;

use super::types::{AuthBackend, LoginRequest, RefreshRequest, TokenResponse};

/// Endpoints and client credentials the adapters need
#[derive(Debug, Clone)]
pub struct BackendEndpoints {
    pub base_url: String,
    pub login_path: String,
    pub refresh_path: String,
    pub token_path: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl BackendEndpoints {
    pub fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

/// Join a base URL and a path without doubling or dropping the slash
pub fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// User-Agent sent on every SmartDrive call
pub const USER_AGENT: &str = concat!("smartdrive-session/", env!("CARGO_PKG_VERSION"));

/// Log in with username/email and password
pub async fn login(
    client: &Client,
    backend: AuthBackend,
    endpoints: &BackendEndpoints,
    identifier: &str,
    password: &str,
    remember_me: bool,
) -> Result<TokenResponse> {
    match backend {
        AuthBackend::CustomLogin => {
            login_custom(client, endpoints, identifier, password, remember_me).await
        }
        AuthBackend::PasswordGrant => {
            login_password_grant(client, endpoints, identifier, password).await
        }
    }
}

/// Exchange a refresh token for a new pair
pub async fn refresh(
    client: &Client,
    backend: AuthBackend,
    endpoints: &BackendEndpoints,
    refresh_token: &str,
) -> Result<TokenResponse> {
    match backend {
        AuthBackend::CustomLogin => refresh_custom(client, endpoints, refresh_token).await,
        AuthBackend::PasswordGrant => {
            refresh_password_grant(client, endpoints, refresh_token).await
        }
    }
}

async fn login_custom(
    client: &Client,
    endpoints: &BackendEndpoints,
    identifier: &str,
    password: &str,
    remember_me: bool,
) -> Result<TokenResponse> {
    tracing::info!("Logging in via custom login endpoint...");

    let request = LoginRequest {
        username_or_email: identifier,
        password,
        remember_me,
    };

    let response = client
        .post(endpoints.url(&endpoints.login_path))
        .json(&request)
        .send()
        .await
        .context("Failed to send login request")?;

    read_token_response(response, "Login").await
}

async fn login_password_grant(
    client: &Client,
    endpoints: &BackendEndpoints,
    username: &str,
    password: &str,
) -> Result<TokenResponse> {
    tracing::info!("Logging in via OAuth2 password grant...");

    let client_id = endpoints
        .client_id
        .as_deref()
        .context("Client ID is required for the password grant")?;

    let mut form = vec![
        ("grant_type", "password"),
        ("username", username),
        ("password", password),
        ("client_id", client_id),
    ];
    if let Some(secret) = endpoints.client_secret.as_deref() {
        form.push(("client_secret", secret));
    }

    let response = client
        .post(endpoints.url(&endpoints.token_path))
        .form(&form)
        .send()
        .await
        .context("Failed to send password grant request")?;

    read_token_response(response, "Password grant").await
}

async fn refresh_custom(
    client: &Client,
    endpoints: &BackendEndpoints,
    refresh_token: &str,
) -> Result<TokenResponse> {
    tracing::info!("Refreshing access token via refresh endpoint...");

    let response = client
        .post(endpoints.url(&endpoints.refresh_path))
        .json(&RefreshRequest { refresh_token })
        .send()
        .await
        .context("Failed to send refresh request")?;

    read_token_response(response, "Refresh").await
}

async fn refresh_password_grant(
    client: &Client,
    endpoints: &BackendEndpoints,
    refresh_token: &str,
) -> Result<TokenResponse> {
    tracing::info!("Refreshing access token via OAuth2 refresh grant...");

    let client_id = endpoints
        .client_id
        .as_deref()
        .context("Client ID is required for the refresh grant")?;

    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
    ];
    if let Some(secret) = endpoints.client_secret.as_deref() {
        form.push(("client_secret", secret));
    }

    let response = client
        .post(endpoints.url(&endpoints.token_path))
        .form(&form)
        .send()
        .await
        .context("Failed to send refresh grant request")?;

    read_token_response(response, "Refresh grant").await
}

/// Turn a token endpoint response into a `TokenResponse` or an error
pub(crate) async fn read_token_response(
    response: reqwest::Response,
    what: &str,
) -> Result<TokenResponse> {
    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::error!("{} failed: status={}, body={}", what, status, error_text);

        // OAuth2 style error bodies carry a readable description
        if let Ok(error_json) = serde_json::from_str::<serde_json::Value>(&error_text) {
            let detail = error_json
                .get("error_description")
                .or_else(|| error_json.get("message"))
                .and_then(|v| v.as_str());
            if let Some(detail) = detail {
                anyhow::bail!("{} failed: {} - {}", what, status, detail);
            }
        }

        anyhow::bail!("{} failed: {} - {}", what, status, error_text);
    }

    let data: TokenResponse = response
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", what.to_lowercase()))?;

    if data.access_token.is_empty() {
        anyhow::bail!("{} response does not contain access_token", what);
    }

    tracing::info!(
        "{} succeeded (expires_in: {})",
        what,
        data.expires_in
            .map(|s| format!("{}s", s))
            .unwrap_or_else(|| "unknown".to_string())
    );

    Ok(data)
}
