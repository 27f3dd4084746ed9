// Integration tests for the SmartDrive session client
//
// These tests run the full stack (credential store, session manager,
// refresh coordinator and request executor) against an in-process
// backend that issues and checks tokens the way the real one does.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use smartdrive_session::{
    api::{ApiResponse, SmartDriveClient},
    auth::{
        CredentialStore, MemoryCredentialStore, ProfileState, RegisterRequest, SessionManager,
        SessionSettings, SessionStatus, SqliteCredentialStore, TokenPair,
    },
    error::SessionError,
    http_client::ApiRequest,
};

// ==================================================================================================
// Test Backend
// ==================================================================================================

/// Token-issuing backend with call counters
struct Backend {
    valid_token: Mutex<String>,
    issued: AtomicUsize,
    refresh_calls: AtomicUsize,
    protected_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    refresh_ok: AtomicBool,
    reject_all: AtomicBool,
    refresh_delay: Mutex<Duration>,
}

impl Backend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            valid_token: Mutex::new(String::new()),
            issued: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            protected_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            refresh_ok: AtomicBool::new(true),
            reject_all: AtomicBool::new(false),
            refresh_delay: Mutex::new(Duration::ZERO),
        })
    }

    fn issue(&self) -> Value {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let access = format!("access-{}", n);
        *self.valid_token.lock().unwrap() = access.clone();
        json!({
            "access_token": access,
            "refresh_token": format!("refresh-{}", n),
            "token_type": "Bearer",
            "expires_in": 900
        })
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        if self.reject_all.load(Ordering::SeqCst) {
            return false;
        }
        let expected = format!("Bearer {}", self.valid_token.lock().unwrap());
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == expected)
            .unwrap_or(false)
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"message": "Full authentication is required"})),
    )
        .into_response()
}

async fn login(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    if body["password"] == "secret" {
        Json(backend.issue()).into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "Bad credentials"})),
        )
            .into_response()
    }
}

async fn refresh(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    backend.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let delay = *backend.refresh_delay.lock().unwrap();
    tokio::time::sleep(delay).await;

    let has_token = body["refresh_token"].as_str().map_or(false, |t| !t.is_empty());
    if has_token && backend.refresh_ok.load(Ordering::SeqCst) {
        Json(backend.issue()).into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid_grant", "error_description": "Refresh token revoked"})),
        )
            .into_response()
    }
}

async fn files(State(backend): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    backend.protected_calls.fetch_add(1, Ordering::SeqCst);
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    Json(json!([{"id": "f1", "name": "notes.txt"}])).into_response()
}

async fn profile(State(backend): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({
        "id": "42",
        "username": "ana",
        "email": "ana@smartdrive.io",
        "firstName": "Ana",
        "lastName": "Lima",
        "roles": ["USER"]
    }))
    .into_response()
}

async fn register(Json(body): Json<Value>) -> Response {
    if body["username"] == "taken" {
        return (
            StatusCode::CONFLICT,
            Json(json!({"message": "Username already taken"})),
        )
            .into_response();
    }
    (
        StatusCode::CREATED,
        Json(json!({"id": "43", "username": body["username"], "email": body["email"]})),
    )
        .into_response()
}

async fn change_password(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    backend.protected_calls.fetch_add(1, Ordering::SeqCst);
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    if body["currentPassword"] != "secret" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "Current password is incorrect"})),
        )
            .into_response();
    }
    StatusCode::OK.into_response()
}

async fn logout(State(backend): State<Arc<Backend>>) -> StatusCode {
    backend.logout_calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

/// Start the backend on an ephemeral port
async fn spawn_backend(backend: Arc<Backend>) -> (String, oneshot::Sender<()>) {
    let app = Router::new()
        .route("/api/v1/auth/login", post(login))
        .route("/api/oauth2/token/refresh", post(refresh))
        .route("/api/v1/files", get(files))
        .route("/api/v1/users/profile", get(profile))
        .route("/api/v1/users/register", post(register))
        .route("/api/v1/users/change-password", post(change_password))
        .route("/auth/api/v1/users/logout", post(logout))
        .with_state(backend);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
    });

    (format!("http://{}", addr), shutdown_tx)
}

fn client_with(base_url: &str, pair: TokenPair) -> (SmartDriveClient, Arc<MemoryCredentialStore>) {
    let store = Arc::new(MemoryCredentialStore::with_pair(pair));
    let session = SessionManager::new(SessionSettings::new(base_url), store.clone()).unwrap();
    (SmartDriveClient::new(session), store)
}

// ==================================================================================================
// Tests
// ==================================================================================================

#[tokio::test]
async fn test_login_then_protected_call() {
    let backend = Backend::new();
    let (url, _shutdown) = spawn_backend(backend.clone()).await;
    let (client, store) = client_with(&url, TokenPair::default());

    let profile = client.login("ana", "secret", false).await.unwrap();
    match profile {
        ProfileState::Loaded(user) => assert_eq!(user.email, "ana@smartdrive.io"),
        other => panic!("unexpected profile state: {:?}", other),
    }
    assert_eq!(store.load(), TokenPair::new("access-1", "refresh-1"));
    assert_eq!(client.session().status(), SessionStatus::Authenticated);

    let response: ApiResponse<Value> = client.get_json("/api/v1/files").await.unwrap();
    assert!(response.success);
    assert_eq!(response.data[0]["id"], "f1");
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_bad_credentials_leave_session_anonymous() {
    let backend = Backend::new();
    let (url, _shutdown) = spawn_backend(backend).await;
    let (client, store) = client_with(&url, TokenPair::default());

    let err = client.login("ana", "wrong", false).await.unwrap_err();
    assert!(matches!(err, SessionError::AuthError(_)));
    assert!(store.load().is_empty());
    assert!(!client.session().is_authenticated().await);
}

#[tokio::test]
async fn test_expired_token_is_refreshed_and_request_retried() {
    let backend = Backend::new();
    let (url, _shutdown) = spawn_backend(backend.clone()).await;
    let (client, store) = client_with(&url, TokenPair::new("stale", "refresh-0"));

    let response: ApiResponse<Value> = client.get_json("/api/v1/files").await.unwrap();

    assert!(response.success);
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.protected_calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.load(), TokenPair::new("access-1", "refresh-1"));
}

#[tokio::test]
async fn test_failed_refresh_ends_session_without_retry() {
    let backend = Backend::new();
    backend.refresh_ok.store(false, Ordering::SeqCst);
    let (url, _shutdown) = spawn_backend(backend.clone()).await;
    let (client, store) = client_with(&url, TokenPair::new("stale", "refresh-0"));
    let status = client.session().subscribe();

    let err = client
        .http()
        .execute(&ApiRequest::get("/api/v1/files"))
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::SessionExpired));
    assert!(err.requires_login());
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.protected_calls.load(Ordering::SeqCst), 1);
    assert!(store.load().is_empty());
    assert_eq!(*status.borrow(), SessionStatus::Anonymous);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_401s_share_one_refresh() {
    let backend = Backend::new();
    *backend.refresh_delay.lock().unwrap() = Duration::from_millis(200);
    let (url, _shutdown) = spawn_backend(backend.clone()).await;
    let (client, _store) = client_with(&url, TokenPair::new("stale", "refresh-0"));

    let calls = (0..5).map(|_| {
        let client = client.clone();
        tokio::spawn(async move { client.get_json::<Value>("/api/v1/files").await })
    });
    let results = futures::future::join_all(calls).await;

    for result in results {
        let response = result.unwrap().unwrap();
        assert!(response.success, "status {}", response.status);
    }
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        client.session().tokens().await,
        TokenPair::new("access-1", "refresh-1")
    );
}

#[tokio::test]
async fn test_second_401_is_returned_not_retried() {
    let backend = Backend::new();
    backend.reject_all.store(true, Ordering::SeqCst);
    let (url, _shutdown) = spawn_backend(backend.clone()).await;
    let (client, _store) = client_with(&url, TokenPair::new("stale", "refresh-0"));

    let response: ApiResponse<Value> = client.get_json("/api/v1/files").await.unwrap();

    assert_eq!(response.status, 401);
    assert!(!response.success);
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.protected_calls.load(Ordering::SeqCst), 2);
    // The refresh itself worked, so the session stays
    assert!(client.session().is_authenticated().await);
}

#[tokio::test]
async fn test_refresh_timeout_counts_as_failure() {
    let backend = Backend::new();
    *backend.refresh_delay.lock().unwrap() = Duration::from_secs(2);
    let (url, _shutdown) = spawn_backend(backend.clone()).await;

    let mut settings = SessionSettings::new(url);
    settings.refresh_timeout = Duration::from_millis(100);
    let store = Arc::new(MemoryCredentialStore::with_pair(TokenPair::new("a0", "r0")));
    let session = SessionManager::new(settings, store.clone()).unwrap();

    assert!(!session.refresh().await);
    assert!(!session.is_refreshing());
    assert_eq!(session.status(), SessionStatus::Anonymous);
    assert!(store.load().is_empty());
}

#[tokio::test]
async fn test_logout_notifies_backend_and_forgets_tokens() {
    let backend = Backend::new();
    let (url, _shutdown) = spawn_backend(backend.clone()).await;
    let (client, store) = client_with(&url, TokenPair::default());

    client.login("ana", "secret", true).await.unwrap();
    client.logout().await;

    assert_eq!(backend.logout_calls.load(Ordering::SeqCst), 1);
    assert!(store.load().is_empty());
    assert_eq!(client.session().status(), SessionStatus::Anonymous);
    assert_eq!(client.session().profile().await, ProfileState::Unknown);
}

#[tokio::test]
async fn test_session_survives_restart() {
    let backend = Backend::new();
    let (url, _shutdown) = spawn_backend(backend.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("session.sqlite3");

    {
        let store = Arc::new(SqliteCredentialStore::open(&db).unwrap());
        let session = SessionManager::new(SessionSettings::new(url.clone()), store).unwrap();
        SmartDriveClient::new(session)
            .login("ana", "secret", true)
            .await
            .unwrap();
    }

    let store = Arc::new(SqliteCredentialStore::open(&db).unwrap());
    let session = SessionManager::new(SessionSettings::new(url), store).unwrap();
    assert!(session.is_authenticated().await);
    assert_eq!(session.status(), SessionStatus::Authenticated);

    let client = SmartDriveClient::new(session);
    let response: ApiResponse<Value> = client.get_json("/api/v1/files").await.unwrap();
    assert!(response.success);
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_register_then_log_in() {
    let backend = Backend::new();
    let (url, _shutdown) = spawn_backend(backend).await;
    let (client, _store) = client_with(&url, TokenPair::default());

    let mut account = RegisterRequest {
        username: "ana".to_string(),
        email: "ana@smartdrive.io".to_string(),
        password: "secret".to_string(),
        confirm_password: "secret".to_string(),
        first_name: "Ana".to_string(),
        last_name: "Lima".to_string(),
    };
    let created = client.register(&account).await.unwrap();
    assert_eq!(created["id"], "43");
    // Registration alone does not sign in
    assert!(!client.session().is_authenticated().await);

    account.username = "taken".to_string();
    match client.register(&account).await.unwrap_err() {
        SessionError::ApiError { status, message } => {
            assert_eq!(status, 409);
            assert_eq!(message, "Username already taken");
        }
        other => panic!("unexpected error: {:?}", other),
    }

    client.login("ana", "secret", false).await.unwrap();
    assert!(client.session().is_authenticated().await);
}

#[tokio::test]
async fn test_change_password_survives_expired_token() {
    let backend = Backend::new();
    let (url, _shutdown) = spawn_backend(backend.clone()).await;
    let (client, _store) = client_with(&url, TokenPair::new("stale", "refresh-0"));

    client.change_password("secret", "n3w-secret").await.unwrap();
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);

    let err = client.change_password("wrong", "x").await.unwrap_err();
    assert!(matches!(err, SessionError::ApiError { status: 400, .. }));
    // A business error leaves the session alone
    assert!(client.session().is_authenticated().await);
}

