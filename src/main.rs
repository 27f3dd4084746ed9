use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use std::sync::Arc;

use smartdrive_session::api::{ApiResponse, SmartDriveClient};
use smartdrive_session::auth::{
    spawn_refresh_task, GoogleCallback, ProfileState, ProfileUpdate, RegisterRequest,
    SessionManager, SessionStatus, SqliteCredentialStore,
};
use smartdrive_session::config::{CliArgs, Command, Config};
use smartdrive_session::http_client::ApiRequest;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; real environment variables win
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let config = Config::from_args(&args)?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!(
        "SmartDrive session client {} ({:?} backend at {})",
        env!("CARGO_PKG_VERSION"),
        config.auth_backend,
        config.api_base_url
    );

    let store = SqliteCredentialStore::open(&config.token_db_file).with_context(|| {
        format!(
            "Failed to open token database {}",
            config.token_db_file.display()
        )
    })?;
    let session = SessionManager::new(config.session_settings(), Arc::new(store))?;
    let client = SmartDriveClient::new(session.clone());

    match args.command {
        Command::Login { username, remember } => {
            login(&client, username, remember).await?;
        }

        Command::Logout => {
            client.logout().await;
            println!("Logged out");
        }

        Command::Register {
            username,
            email,
            first_name,
            last_name,
        } => {
            let password = dialoguer::Password::new()
                .with_prompt("Password")
                .with_confirmation("Confirm password", "Passwords do not match")
                .interact()?;
            let account = RegisterRequest {
                username,
                email,
                confirm_password: password.clone(),
                password,
                first_name,
                last_name,
            };
            client.register(&account).await?;
            println!("Account created. Check your inbox to verify your email.");
        }

        Command::VerifyEmail { token } => {
            client.verify_email(&token).await?;
            println!("Email verified");
        }

        Command::ChangePassword => {
            require_session(&session).await?;
            let current = dialoguer::Password::new()
                .with_prompt("Current password")
                .interact()?;
            let new = dialoguer::Password::new()
                .with_prompt("New password")
                .with_confirmation("Confirm new password", "Passwords do not match")
                .interact()?;
            client.change_password(&current, &new).await?;
            println!("Password changed");
        }

        Command::UpdateProfile {
            first_name,
            last_name,
            email,
        } => {
            let update = ProfileUpdate {
                first_name,
                last_name,
                email,
            };
            let profile = client.update_profile(&update).await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }

        Command::Status => print_status(&session).await,

        Command::Whoami => {
            require_session(&session).await?;
            let profile = client.fetch_profile().await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }

        Command::Refresh => {
            require_session(&session).await?;
            if session.refresh().await {
                println!("Tokens refreshed");
            } else {
                anyhow::bail!("Token refresh failed; please log in again");
            }
        }

        Command::Request { method, path, data } => {
            let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method: {}", method))?;
            let mut request = ApiRequest::new(method, path);
            if let Some(data) = data {
                let body: Value =
                    serde_json::from_str(&data).context("--data must be valid JSON")?;
                request = request.json(body);
            }

            let response: ApiResponse<Value> = client.send(request).await?;
            print_response(&response)?;
        }

        Command::Upload {
            file,
            path,
            metadata,
        } => {
            let metadata = metadata
                .map(|m| serde_json::from_str::<Value>(&m))
                .transpose()
                .context("--metadata must be valid JSON")?;
            let response = client.upload_file(&path, &file, metadata.as_ref()).await?;
            print_response(&response)?;
        }

        Command::GoogleUrl { redirect_uri } => {
            let redirect_uri = redirect_uri.unwrap_or_else(|| config.google_redirect_uri.clone());
            let url = session.google_login_url(Some(&redirect_uri)).await?;
            println!("{}", url);
        }

        Command::GoogleCallback { query } => {
            let callback = GoogleCallback::from_query(&query)?;
            let profile = client.complete_google_callback(callback).await?;
            println!("Signed in with Google");
            print_profile(&profile);
        }

        Command::Watch => watch(&session, &config).await?,
    }

    Ok(())
}

async fn login(client: &SmartDriveClient, username: Option<String>, remember: bool) -> Result<()> {
    let username = match username {
        Some(username) => username,
        None => dialoguer::Input::<String>::new()
            .with_prompt("Username or email")
            .interact_text()?,
    };

    let password = match std::env::var("SMARTDRIVE_PASSWORD") {
        Ok(password) if !password.is_empty() => password,
        _ => dialoguer::Password::new()
            .with_prompt("Password")
            .interact()?,
    };

    let profile = client.login(&username, &password, remember).await?;
    println!("✅ Logged in as {}", username);
    print_profile(&profile);
    Ok(())
}

async fn require_session(session: &SessionManager) -> Result<()> {
    session
        .require_authenticated()
        .await
        .context("Run `smartdrive login` first")
}

async fn print_status(session: &SessionManager) {
    let authenticated = session.is_authenticated().await;
    println!("  Status:      {:?}", session.status());
    println!("  Logged in:   {}", if authenticated { "yes" } else { "no" });
    if !authenticated {
        return;
    }

    match session.current_claims().await {
        Some(claims) => {
            if let Some(username) = &claims.username {
                println!("  User:        {}", username);
            }
            if let Some(email) = &claims.email {
                println!("  Email:       {}", email);
            }
            if !claims.roles.is_empty() {
                let roles: Vec<&str> = claims.roles.iter().map(String::as_str).collect();
                println!("  Roles:       {}", roles.join(", "));
            }
            if let Some(exp) = claims.expires_at {
                let expires = chrono::DateTime::from_timestamp(exp, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| exp.to_string());
                println!("  Expires:     {}", expires);
            }
            println!(
                "  Near expiry: {}",
                if session.is_near_expiry().await { "yes" } else { "no" }
            );
        }
        None => println!("  Token:       opaque (no readable claims)"),
    }
}

fn print_profile(profile: &ProfileState) {
    match profile {
        ProfileState::Loaded(user) => {
            println!("  User:  {} <{}>", user.username, user.email);
        }
        ProfileState::Unavailable { reason } => {
            println!("  Profile unavailable: {}", reason);
        }
        ProfileState::Unknown => {}
    }
}

fn print_response(response: &ApiResponse<Value>) -> Result<()> {
    eprintln!("HTTP {}", response.status);
    if !response.data.is_null() {
        println!("{}", serde_json::to_string_pretty(&response.data)?);
    }
    if !response.success {
        anyhow::bail!("Request failed with status {}", response.status);
    }
    Ok(())
}

/// Keep the session alive until Ctrl+C or until it ends
async fn watch(session: &SessionManager, config: &Config) -> Result<()> {
    require_session(session).await?;

    let task = spawn_refresh_task(session.clone(), config.check_interval());
    let mut status = session.subscribe();
    tracing::info!(
        "Watching session, checking expiry every {}s",
        config.token_check_interval
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                tracing::info!("Session status: {:?}", current);
                if current == SessionStatus::Anonymous {
                    tracing::warn!("Session ended, log in again to continue");
                    break;
                }
            }
        }
    }

    task.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, stopping...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, stopping...");
        },
    }
}
