//! Bearer-token authorization.
//!
//! Identity issuance lives elsewhere; the relay only consumes its output: a
//! bearer credential mapped to a stable subject id. Tokens are validated
//! before any data is relayed - a failed validation rejects the connection
//! attempt outright, never partially admits it.

use std::sync::Mutex;

use axum::http::HeaderMap;
use rusqlite::{Connection, OptionalExtension, params};

/// Authenticated subject behind a bearer token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub user_name: String,
}

/// SQLite-backed token table.
pub struct TokenStore {
    conn: Mutex<Connection>,
}

impl TokenStore {
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS access_tokens (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                user_name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            -- Page-level grants. A page with no rows is open to any
            -- authenticated user; otherwise the user must be listed.
            CREATE TABLE IF NOT EXISTS page_access (
                page_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                PRIMARY KEY (page_id, user_id)
            );
            "#,
        )?;
        Ok(())
    }

    pub fn insert_token(
        &self,
        token: &str,
        user_id: &str,
        user_name: &str,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO access_tokens (token, user_id, user_name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![token, user_id, user_name, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Validate a bearer token, returning the subject behind it.
    pub fn validate(&self, token: &str) -> Option<AuthUser> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT user_id, user_name FROM access_tokens WHERE token = ?1",
            params![token],
            |row| {
                Ok(AuthUser {
                    user_id: row.get(0)?,
                    user_name: row.get(1)?,
                })
            },
        )
        .optional()
        .ok()
        .flatten()
    }

    /// Restrict a page to a specific user (additive; first grant closes the
    /// page to everyone unlisted).
    pub fn grant_access(&self, page_id: &str, user_id: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO page_access (page_id, user_id) VALUES (?1, ?2)",
            params![page_id, user_id],
        )?;
        Ok(())
    }

    /// Whether an authenticated user may join a page's channel.
    pub fn is_permitted(&self, page_id: &str, user_id: &str) -> bool {
        let conn = self.conn.lock().unwrap();
        let restricted: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM page_access WHERE page_id = ?1",
                params![page_id],
                |row| row.get(0),
            )
            .unwrap_or(0);
        if restricted == 0 {
            return true;
        }
        conn.query_row(
            "SELECT 1 FROM page_access WHERE page_id = ?1 AND user_id = ?2",
            params![page_id, user_id],
            |_| Ok(()),
        )
        .optional()
        .ok()
        .flatten()
        .is_some()
    }
}

/// Extract the bearer token from the `Authorization` header or the `token`
/// query parameter (browsers cannot set headers on WebSocket upgrades).
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let header_token = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    header_token.or_else(|| query_token.map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_known_and_unknown_token() {
        let store = TokenStore::in_memory().unwrap();
        store.insert_token("tok-1", "alice", "Alice").unwrap();

        let user = store.validate("tok-1").unwrap();
        assert_eq!(user.user_id, "alice");
        assert_eq!(user.user_name, "Alice");

        assert!(store.validate("tok-unknown").is_none());
    }

    #[test]
    fn test_unrestricted_page_open_to_authenticated_users() {
        let store = TokenStore::in_memory().unwrap();
        assert!(store.is_permitted("page-1", "anyone"));
    }

    #[test]
    fn test_restricted_page_requires_grant() {
        let store = TokenStore::in_memory().unwrap();
        store.grant_access("page-1", "alice").unwrap();

        assert!(store.is_permitted("page-1", "alice"));
        assert!(!store.is_permitted("page-1", "bob"));
        // Other pages stay open.
        assert!(store.is_permitted("page-2", "bob"));
    }

    #[test]
    fn test_extract_token_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearer from-header".parse().unwrap());

        assert_eq!(
            extract_token(&headers, Some("from-query")).as_deref(),
            Some("from-header")
        );
        assert_eq!(
            extract_token(&HeaderMap::new(), Some("from-query")).as_deref(),
            Some("from-query")
        );
        assert_eq!(extract_token(&HeaderMap::new(), None), None);
    }
}
