use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{AuthBackend, BackendEndpoints, SessionSettings};

/// SmartDrive session client
#[derive(Parser, Debug)]
#[command(name = "smartdrive", author, version, about, long_about = None)]
pub struct CliArgs {
    /// SmartDrive API gateway URL
    #[arg(short = 'a', long, env = "SMARTDRIVE_API_URL", default_value = "http://localhost:8080", global = true)]
    pub api_url: String,

    /// Login contract spoken by the backend (custom, password-grant)
    #[arg(long, env = "SMARTDRIVE_AUTH_BACKEND", default_value = "custom", global = true)]
    pub auth_backend: String,

    /// OAuth2 client id (password-grant backend)
    #[arg(long, env = "SMARTDRIVE_CLIENT_ID", global = true)]
    pub client_id: Option<String>,

    /// OAuth2 client secret (password-grant backend)
    #[arg(long, env = "SMARTDRIVE_CLIENT_SECRET", hide_env_values = true, global = true)]
    pub client_secret: Option<String>,

    /// Path to the token database
    #[arg(short = 'd', long, env = "SMARTDRIVE_TOKEN_DB", global = true)]
    pub token_db: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Seconds before expiry at which the access token is refreshed
    #[arg(long, env = "TOKEN_REFRESH_THRESHOLD", default_value = "300", global = true)]
    pub refresh_threshold: u64,

    /// Seconds between proactive expiry checks
    #[arg(long, env = "TOKEN_CHECK_INTERVAL", default_value = "60", global = true)]
    pub check_interval: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60", global = true)]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in with username or email and password
    Login {
        /// Username or email (prompted when omitted)
        #[arg(short, long)]
        username: Option<String>,

        /// Ask the backend for a long-lived session
        #[arg(long)]
        remember: bool,
    },

    /// Log out and forget stored tokens
    Logout,

    /// Create an account (password is prompted)
    Register {
        #[arg(short, long)]
        username: String,

        #[arg(short, long)]
        email: String,

        #[arg(long)]
        first_name: String,

        #[arg(long)]
        last_name: String,
    },

    /// Confirm an email address with the token from the verification link
    VerifyEmail { token: String },

    /// Change the password of the signed-in user (prompted)
    ChangePassword,

    /// Update profile fields of the signed-in user
    UpdateProfile {
        #[arg(long)]
        first_name: Option<String>,

        #[arg(long)]
        last_name: Option<String>,

        #[arg(long)]
        email: Option<String>,
    },

    /// Show session state and the (unverified) token claims
    Status,

    /// Fetch the user profile from the backend
    Whoami,

    /// Refresh the token pair now
    Refresh,

    /// Send an authenticated request and print the response
    Request {
        /// HTTP method
        method: String,

        /// Path relative to the API URL
        path: String,

        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },

    /// Upload a file
    Upload {
        file: PathBuf,

        /// Upload endpoint
        #[arg(long, default_value = "/api/v1/files/upload")]
        path: String,

        /// JSON metadata sent alongside the file
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Print the Google sign-in URL
    GoogleUrl {
        #[arg(long)]
        redirect_uri: Option<String>,
    },

    /// Complete Google sign-in from the callback query string or URL
    GoogleCallback { query: String },

    /// Keep the session fresh until interrupted
    Watch,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub api_base_url: String,
    pub auth_backend: AuthBackend,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,

    // Endpoints
    pub login_path: String,
    pub refresh_path: String,
    pub token_path: String,
    pub profile_path: String,
    pub logout_path: Option<String>,
    pub google_login_url_path: String,
    pub google_callback_path: String,
    pub google_redirect_uri: String,

    // Token storage
    pub token_db_file: PathBuf,

    // Token lifecycle
    pub token_refresh_threshold: u64,
    pub token_check_interval: u64,
    pub token_refresh_timeout: u64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let auth_backend = AuthBackend::parse(&args.auth_backend).with_context(|| {
            format!(
                "Unknown auth backend '{}' (expected 'custom' or 'password-grant')",
                args.auth_backend
            )
        })?;

        let token_db_file = args
            .token_db
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(default_token_db);

        let logout_path = env_or("SMARTDRIVE_LOGOUT_PATH", "/auth/api/v1/users/logout");

        Ok(Config {
            api_base_url: args.api_url.trim_end_matches('/').to_string(),
            auth_backend,
            client_id: args.client_id.clone().filter(|s| !s.is_empty()),
            client_secret: args.client_secret.clone().filter(|s| !s.is_empty()),

            login_path: env_or("SMARTDRIVE_LOGIN_PATH", "/api/v1/auth/login"),
            refresh_path: env_or("SMARTDRIVE_REFRESH_PATH", "/api/oauth2/token/refresh"),
            token_path: env_or("SMARTDRIVE_TOKEN_PATH", "/auth/oauth2/token"),
            profile_path: env_or("SMARTDRIVE_PROFILE_PATH", "/api/v1/users/profile"),
            // An empty value turns the backend logout call off
            logout_path: Some(logout_path).filter(|p| !p.is_empty()),
            google_login_url_path: env_or(
                "SMARTDRIVE_GOOGLE_LOGIN_URL_PATH",
                "/api/v1/auth/social/google/login-url",
            ),
            google_callback_path: env_or(
                "SMARTDRIVE_GOOGLE_CALLBACK_PATH",
                "/api/v1/auth/social/google/callback",
            ),
            google_redirect_uri: env_or(
                "SMARTDRIVE_GOOGLE_REDIRECT_URI",
                "http://localhost:5173/auth/google/callback",
            ),

            token_db_file,

            token_refresh_threshold: args.refresh_threshold,
            token_check_interval: args.check_interval,
            token_refresh_timeout: env_parse("TOKEN_REFRESH_TIMEOUT", 10),

            http_connect_timeout: env_parse("HTTP_CONNECT_TIMEOUT", 10),
            http_request_timeout: args.http_timeout,

            log_level: args.log_level.clone(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            anyhow::bail!(
                "SMARTDRIVE_API_URL must be an http(s) URL: {}",
                self.api_base_url
            );
        }

        if self.auth_backend == AuthBackend::PasswordGrant && self.client_id.is_none() {
            anyhow::bail!("SMARTDRIVE_CLIENT_ID is required for the password-grant backend");
        }

        if self.token_check_interval == 0 {
            anyhow::bail!("TOKEN_CHECK_INTERVAL must be at least 1 second");
        }

        if self.token_refresh_timeout == 0 {
            anyhow::bail!("TOKEN_REFRESH_TIMEOUT must be at least 1 second");
        }

        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            backend: self.auth_backend,
            endpoints: BackendEndpoints {
                base_url: self.api_base_url.clone(),
                login_path: self.login_path.clone(),
                refresh_path: self.refresh_path.clone(),
                token_path: self.token_path.clone(),
                client_id: self.client_id.clone(),
                client_secret: self.client_secret.clone(),
            },
            profile_path: self.profile_path.clone(),
            logout_path: self.logout_path.clone(),
            google_login_url_path: self.google_login_url_path.clone(),
            google_callback_path: self.google_callback_path.clone(),
            refresh_threshold: self.token_refresh_threshold as i64,
            refresh_timeout: Duration::from_secs(self.token_refresh_timeout),
            connect_timeout: Duration::from_secs(self.http_connect_timeout),
            request_timeout: Duration::from_secs(self.http_request_timeout),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.token_check_interval)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Default token database location: ~/.smartdrive/session.sqlite3
fn default_token_db() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".smartdrive").join("session.sqlite3"))
        .unwrap_or_else(|| PathBuf::from("session.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
