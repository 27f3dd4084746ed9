use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;

use crate::auth::SessionManager;
use crate::error::{Result, SessionError};

/// Body of an outgoing API request
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
    /// Rebuilt on every attempt; reqwest sets the multipart boundary header
    Multipart(Vec<MultipartField>),
}

#[derive(Debug, Clone)]
pub enum MultipartField {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        bytes: Vec<u8>,
        mime: Option<String>,
    },
}

/// A backend call that can be sent more than once
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = RequestBody::Form(fields);
        self
    }

    pub fn multipart(mut self, fields: Vec<MultipartField>) -> Self {
        self.body = RequestBody::Multipart(fields);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// HTTP client for the SmartDrive API
/// Attaches the bearer token, refreshes on 401 and retries once
#[derive(Clone)]
pub struct SessionHttpClient {
    session: SessionManager,
}

impl SessionHttpClient {
    pub fn new(session: SessionManager) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Send `request` with the current access token
    ///
    /// - 401 with a refresh token: refresh (shared with concurrent callers),
    ///   then resend exactly once and return that response whatever it is
    /// - refresh failed: the session is gone, `SessionError::SessionExpired`
    /// - anything else: the response is returned untouched
    pub async fn execute(&self, request: &ApiRequest) -> Result<Response> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let sent_token = self.session.access_token().await;

        let response = self
            .send(request, sent_token.as_deref(), &request_id)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let current = self.session.access_token().await;
        if sent_token.is_some() && current.is_none() {
            tracing::warn!("[{}] Session ended while request was in flight", request_id);
            return Err(SessionError::SessionExpired);
        }

        if !self.session.has_refresh_token().await {
            tracing::debug!("[{}] 401 without a refresh token, passing through", request_id);
            return Ok(response);
        }

        // Someone else may have refreshed while this request was in flight
        let token_changed = current.is_some() && current != sent_token;

        if !token_changed {
            tracing::warn!("[{}] Access token rejected, attempting refresh...", request_id);
            // A failed refresh has already torn the session down
            if !self.session.refresh().await {
                let now = self.session.access_token().await;
                if now.is_none() || now == sent_token {
                    tracing::error!("[{}] Token refresh failed, session ended", request_id);
                    return Err(SessionError::SessionExpired);
                }
                tracing::info!("[{}] Session replaced while refreshing", request_id);
            }
        }

        let token = self.session.access_token().await;
        tracing::info!("[{}] Token refreshed, retrying request", request_id);
        self.send(request, token.as_deref(), &request_id).await
    }

    async fn send(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
        request_id: &str,
    ) -> Result<Response> {
        let builder = self.build(request, token)?;

        tracing::debug!(
            request_id = request_id,
            method = %request.method,
            path = %request.path,
            "Sending HTTP request"
        );

        match builder.send().await {
            Ok(response) => {
                tracing::debug!(
                    request_id = request_id,
                    status = %response.status(),
                    "Received HTTP response"
                );
                Ok(response)
            }
            Err(e) => {
                let error_kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection_failed"
                } else if e.is_request() {
                    "request_error"
                } else if e.is_body() {
                    "body_error"
                } else {
                    "unknown"
                };

                tracing::warn!(
                    request_id = request_id,
                    error_kind = error_kind,
                    error = %e,
                    path = %request.path,
                    "HTTP request error"
                );
                Err(SessionError::Transport(e))
            }
        }
    }

    fn build(&self, request: &ApiRequest, token: Option<&str>) -> Result<RequestBuilder> {
        let url = self.session.settings().url(&request.path);
        let mut builder = self
            .session
            .client()
            .request(request.method.clone(), url);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        builder = match &request.body {
            RequestBody::Empty => builder.header(CONTENT_TYPE, "application/json"),
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Form(fields) => builder.form(fields),
            RequestBody::Multipart(fields) => builder.multipart(build_form(fields)?),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        Ok(builder)
    }
}

fn build_form(fields: &[MultipartField]) -> Result<Form> {
    let mut form = Form::new();
    for field in fields {
        form = match field {
            MultipartField::Text { name, value } => form.text(name.clone(), value.clone()),
            MultipartField::File {
                name,
                file_name,
                bytes,
                mime,
            } => {
                let mut part = Part::bytes(bytes.clone()).file_name(file_name.clone());
                if let Some(mime) = mime {
                    part = part.mime_str(mime).map_err(|e| {
                        SessionError::ValidationError(format!("Invalid MIME type {}: {}", mime, e))
                    })?;
                }
                form.part(name.clone(), part)
            }
        };
    }
    Ok(form)
}
