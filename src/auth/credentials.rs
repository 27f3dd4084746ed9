// Durable token storage
// SQLite key/value table on disk, or plain memory for ephemeral sessions

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::types::TokenPair;

const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Persistence for the current token pair
pub trait CredentialStore: Send + Sync {
    /// Load the stored pair; missing or unreadable entries come back as `None`
    fn load(&self) -> TokenPair;

    /// Replace both entries. A `None` half removes that entry.
    fn save(&self, pair: &TokenPair) -> Result<()>;

    /// Remove both entries. Idempotent.
    fn clear(&self) -> Result<()>;
}

/// Credential store backed by an `auth_kv` table
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
    /// Open (or create) the token database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create token directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::with_connection(conn)
    }

    /// In-memory SQLite database, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn read_pair(&self) -> Result<TokenPair> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("credential store lock poisoned"))?;

        let get = |key: &str| -> Result<Option<String>> {
            conn.query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("Failed to read {} from SQLite", key))
        };

        Ok(TokenPair {
            access_token: get(ACCESS_TOKEN_KEY)?,
            refresh_token: get(REFRESH_TOKEN_KEY)?,
        })
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn load(&self) -> TokenPair {
        match self.read_pair() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!("Failed to load stored tokens: {:#}", e);
                TokenPair::default()
            }
        }
    }

    fn save(&self, pair: &TokenPair) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("credential store lock poisoned"))?;

        let tx = conn.transaction().context("Failed to begin token transaction")?;
        for (key, value) in [
            (ACCESS_TOKEN_KEY, &pair.access_token),
            (REFRESH_TOKEN_KEY, &pair.refresh_token),
        ] {
            let written = match value {
                Some(v) => tx.execute(
                    "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, v],
                ),
                None => tx.execute("DELETE FROM auth_kv WHERE key = ?1", params![key]),
            };
            written.with_context(|| format!("Failed to write {} to SQLite", key))?;
        }
        tx.commit().context("Failed to commit tokens")?;

        tracing::debug!("Tokens stored");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("credential store lock poisoned"))?;

        conn.execute(
            "DELETE FROM auth_kv WHERE key IN (?1, ?2)",
            params![ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY],
        )
        .context("Failed to clear tokens from SQLite")?;

        tracing::debug!("Tokens cleared");
        Ok(())
    }
}

/// Credential store that lives only as long as the process
#[derive(Default)]
pub struct MemoryCredentialStore {
    pair: Mutex<TokenPair>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: TokenPair) -> Self {
        Self {
            pair: Mutex::new(pair),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> TokenPair {
        self.pair
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    fn save(&self, pair: &TokenPair) -> Result<()> {
        let mut guard = self
            .pair
            .lock()
            .map_err(|_| anyhow::anyhow!("credential store lock poisoned"))?;
        *guard = pair.clone();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut guard = self
            .pair
            .lock()
            .map_err(|_| anyhow::anyhow!("credential store lock poisoned"))?;
        *guard = TokenPair::default();
        Ok(())
    }
}
