// Google OAuth2 login helpers
//
// The login window reports back over a message channel. Polling the window
// state is only a fallback for a window closed without a message.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// How often the "window closed" probe is consulted
const CLOSED_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OAuthError {
    /// Google redirected back with `error=...`
    #[error("provider returned error: {0}")]
    Provider(String),

    #[error("no authorization code received from Google")]
    MissingCode,

    #[error("invalid callback: {0}")]
    InvalidCallback(String),

    /// The login window reported `LOGIN_ERROR`
    #[error("{0}")]
    LoginFailed(String),

    #[error("login window closed before completing")]
    Closed,

    #[error("timed out after {0:?} waiting for the login window")]
    Timeout(Duration),
}

/// Result of a Google redirect back to the application
#[derive(Debug, Clone, PartialEq)]
pub enum GoogleCallback {
    /// Authorization code to exchange with the backend
    Code { code: String, state: Option<String> },

    /// Backend already exchanged the code and put the tokens in the redirect
    Tokens {
        access_token: String,
        refresh_token: Option<String>,
    },
}

impl GoogleCallback {
    /// Parse the query string of a callback redirect
    ///
    /// Accepts a bare query (`code=..&state=..`), one with a leading `?`, or
    /// a full callback URL.
    pub fn from_query(input: &str) -> Result<Self, OAuthError> {
        let input = input.trim();
        let url = if input.contains("://") {
            Url::parse(input)
        } else {
            Url::parse(&format!(
                "http://localhost/callback?{}",
                input.trim_start_matches('?')
            ))
        }
        .map_err(|e| OAuthError::InvalidCallback(e.to_string()))?;

        let mut code = None;
        let mut state = None;
        let mut error = None;
        let mut access_token = None;
        let mut refresh_token = None;

        for (key, value) in url.query_pairs() {
            let value = value.into_owned();
            match key.as_ref() {
                "code" => code = Some(value),
                "state" => state = Some(value),
                "error" => error = Some(value),
                "access_token" | "accessToken" => access_token = Some(value),
                "refresh_token" | "refreshToken" => refresh_token = Some(value),
                _ => {}
            }
        }

        if let Some(error) = error {
            return Err(OAuthError::Provider(error));
        }

        if let Some(access_token) = access_token.filter(|t| !t.is_empty()) {
            return Ok(GoogleCallback::Tokens {
                access_token,
                refresh_token: refresh_token.filter(|t| !t.is_empty()),
            });
        }

        match code.filter(|c| !c.is_empty()) {
            Some(code) => Ok(GoogleCallback::Code { code, state }),
            None => Err(OAuthError::MissingCode),
        }
    }
}

/// Message posted by the login window to its opener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoginMessage {
    LoginSuccess,
    LoginError { error: String },
}

impl LoginMessage {
    pub fn parse(raw: &str) -> Result<Self, OAuthError> {
        serde_json::from_str(raw).map_err(|e| OAuthError::InvalidCallback(e.to_string()))
    }
}

fn settle(message: LoginMessage) -> Result<(), OAuthError> {
    match message {
        LoginMessage::LoginSuccess => Ok(()),
        LoginMessage::LoginError { error } => Err(OAuthError::LoginFailed(error)),
    }
}

/// Wait for the login window to report success or failure
///
/// `is_closed` is polled as a fallback; a closed window with no pending
/// message, or a dropped sender, ends the wait with `OAuthError::Closed`.
pub async fn await_login_message<F>(
    rx: &mut mpsc::Receiver<LoginMessage>,
    timeout: Duration,
    is_closed: F,
) -> Result<(), OAuthError>
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut probe = tokio::time::interval(CLOSED_POLL_INTERVAL);
    probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            message = rx.recv() => {
                return match message {
                    Some(message) => settle(message),
                    None => Err(OAuthError::Closed),
                };
            }
            _ = &mut deadline => {
                tracing::warn!("Gave up waiting for the Google login window after {:?}", timeout);
                return Err(OAuthError::Timeout(timeout));
            }
            _ = probe.tick() => {
                if is_closed() {
                    // A message may have landed between the recv poll and the probe
                    if let Ok(message) = rx.try_recv() {
                        return settle(message);
                    }
                    tracing::debug!("Google login window closed without a message");
                    return Err(OAuthError::Closed);
                }
            }
        }
    }
}
