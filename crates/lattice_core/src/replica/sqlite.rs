//! SQLite-backed replica store.
//!
//! The durable client-side backend. Edge-set replacement runs inside a
//! transaction so a failure mid-replacement rolls back to the prior set.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};

use super::store::ReplicaStore;
use super::types::{GhostLink, Link, PageMetadata};
use crate::error::Result;

/// SQLite-backed replica store.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex`; SQLite runs in serialized
/// threading mode.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn ts_to_db(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn ts_from_db(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn page_from_row(row: &Row<'_>) -> rusqlite::Result<PageMetadata> {
    Ok(PageMetadata {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        source_page_id: row.get(2)?,
        title: row.get(3)?,
        content_preview: row.get(4)?,
        thumbnail_url: row.get(5)?,
        source_url: row.get(6)?,
        created_at: ts_from_db(row.get(7)?),
        updated_at: ts_from_db(row.get(8)?),
        is_deleted: row.get::<_, i64>(9)? != 0,
    })
}

const PAGE_COLUMNS: &str = "id, owner_id, source_page_id, title, content_preview, \
     thumbnail_url, source_url, created_at, updated_at, is_deleted";

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory database for tests; data is lost on drop.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Page metadata. Deleted rows are tombstones, never removed here.
            CREATE TABLE IF NOT EXISTS pages (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                source_page_id TEXT,
                title TEXT NOT NULL,
                content_preview TEXT NOT NULL DEFAULT '',
                thumbnail_url TEXT,
                source_url TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS links (
                source_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (source_id, target_id)
            );

            CREATE INDEX IF NOT EXISTS idx_links_target ON links(target_id);

            CREATE TABLE IF NOT EXISTS ghost_links (
                link_text TEXT NOT NULL,
                source_page_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                original_target_page_id TEXT,
                original_note_id TEXT,
                PRIMARY KEY (link_text, source_page_id)
            );

            -- One opaque CRDT blob per page.
            CREATE TABLE IF NOT EXISTS documents (
                page_id TEXT PRIMARY KEY,
                state BLOB NOT NULL,
                version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Denormalized text index maintained by callers.
            CREATE TABLE IF NOT EXISTS search_index (
                page_id TEXT PRIMARY KEY,
                content TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl ReplicaStore for SqliteStore {
    async fn get_all_pages(&self) -> Result<Vec<PageMetadata>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("SELECT {PAGE_COLUMNS} FROM pages ORDER BY created_at"))?;
        let pages = stmt
            .query_map([], page_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pages)
    }

    async fn get_page(&self, id: &str) -> Result<Option<PageMetadata>> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            &format!("SELECT {PAGE_COLUMNS} FROM pages WHERE id = ?1"),
            params![id],
            page_from_row,
        );
        match result {
            Ok(page) => Ok(Some(page)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert_page(&self, meta: &PageMetadata) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO pages
             (id, owner_id, source_page_id, title, content_preview,
              thumbnail_url, source_url, created_at, updated_at, is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                meta.id,
                meta.owner_id,
                meta.source_page_id,
                meta.title,
                meta.content_preview,
                meta.thumbnail_url,
                meta.source_url,
                ts_to_db(&meta.created_at),
                ts_to_db(&meta.updated_at),
                meta.is_deleted as i64,
            ],
        )?;
        Ok(())
    }

    async fn delete_page(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pages SET is_deleted = 1, updated_at = ?1 WHERE id = ?2",
            params![ts_to_db(&Utc::now()), id],
        )?;
        Ok(())
    }

    async fn get_links(&self, page_id: &str) -> Result<Vec<Link>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source_id, target_id, created_at FROM links WHERE source_id = ?1",
        )?;
        let links = stmt
            .query_map(params![page_id], |row| {
                Ok(Link {
                    source_id: row.get(0)?,
                    target_id: row.get(1)?,
                    created_at: ts_from_db(row.get(2)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    async fn get_backlinks(&self, page_id: &str) -> Result<Vec<Link>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source_id, target_id, created_at FROM links WHERE target_id = ?1",
        )?;
        let links = stmt
            .query_map(params![page_id], |row| {
                Ok(Link {
                    source_id: row.get(0)?,
                    target_id: row.get(1)?,
                    created_at: ts_from_db(row.get(2)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    async fn get_all_links(&self) -> Result<Vec<Link>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT source_id, target_id, created_at FROM links")?;
        let links = stmt
            .query_map([], |row| {
                Ok(Link {
                    source_id: row.get(0)?,
                    target_id: row.get(1)?,
                    created_at: ts_from_db(row.get(2)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    async fn save_links(&self, source_page_id: &str, links: &[Link]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM links WHERE source_id = ?1", params![source_page_id])?;
        for link in links {
            tx.execute(
                "INSERT OR REPLACE INTO links (source_id, target_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![source_page_id, link.target_id, ts_to_db(&link.created_at)],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_ghost_links(&self, source_page_id: &str) -> Result<Vec<GhostLink>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT link_text, source_page_id, created_at, original_target_page_id, original_note_id
             FROM ghost_links WHERE source_page_id = ?1",
        )?;
        let ghosts = stmt
            .query_map(params![source_page_id], ghost_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ghosts)
    }

    async fn get_ghost_links_by_text(&self, text: &str) -> Result<Vec<GhostLink>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT link_text, source_page_id, created_at, original_target_page_id, original_note_id
             FROM ghost_links WHERE link_text = ?1",
        )?;
        let ghosts = stmt
            .query_map(params![text], ghost_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ghosts)
    }

    async fn get_all_ghost_links(&self) -> Result<Vec<GhostLink>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT link_text, source_page_id, created_at, original_target_page_id, original_note_id
             FROM ghost_links",
        )?;
        let ghosts = stmt
            .query_map([], ghost_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ghosts)
    }

    async fn save_ghost_links(&self, source_page_id: &str, links: &[GhostLink]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM ghost_links WHERE source_page_id = ?1",
            params![source_page_id],
        )?;
        for ghost in links {
            tx.execute(
                "INSERT OR REPLACE INTO ghost_links
                 (link_text, source_page_id, created_at, original_target_page_id, original_note_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    ghost.link_text,
                    source_page_id,
                    ts_to_db(&ghost.created_at),
                    ghost.original_target_page_id,
                    ghost.original_note_id,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_document_state(&self, page_id: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT state FROM documents WHERE page_id = ?1",
            params![page_id],
            |row| row.get(0),
        );
        match result {
            Ok(state) => Ok(Some(state)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_document_state(&self, page_id: &str, state: &[u8], version: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO documents (page_id, state, version, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![page_id, state, version, ts_to_db(&Utc::now())],
        )?;
        Ok(())
    }

    async fn get_document_version(&self, page_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT version FROM documents WHERE page_id = ?1",
            params![page_id],
            |row| row.get(0),
        );
        match result {
            Ok(version) => Ok(version),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn search_pages(&self, query: &str) -> Result<Vec<PageMetadata>> {
        let needle = format!("%{}%", query.to_lowercase());
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT {PAGE_COLUMNS} FROM pages p
             LEFT JOIN search_index s ON s.page_id = p.id
             WHERE p.is_deleted = 0
               AND (lower(p.title) LIKE ?1 OR lower(s.content) LIKE ?1)
             ORDER BY p.updated_at DESC"
        ))?;
        let pages = stmt
            .query_map(params![needle], page_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pages)
    }

    async fn update_search_index(&self, page_id: &str, text: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO search_index (page_id, content) VALUES (?1, ?2)",
            params![page_id, text],
        )?;
        Ok(())
    }

    async fn get_last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT value FROM sync_state WHERE key = 'last_sync_time'",
            [],
            |row| row.get::<_, i64>(0),
        );
        match result {
            Ok(ms) => Ok(Some(ts_from_db(ms))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_last_sync_time(&self, ts: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO sync_state (key, value) VALUES ('last_sync_time', ?1)",
            params![ts_to_db(&ts)],
        )?;
        Ok(())
    }
}

fn ghost_from_row(row: &Row<'_>) -> rusqlite::Result<GhostLink> {
    Ok(GhostLink {
        link_text: row.get(0)?,
        source_page_id: row.get(1)?,
        created_at: ts_from_db(row.get(2)?),
        original_target_page_id: row.get(3)?,
        original_note_id: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> SqliteStore {
        SqliteStore::in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_page_round_trip() {
        let store = open_store();
        let mut page = PageMetadata::new("user-1", "Persisted");
        page.content_preview = "First lines".into();
        page.thumbnail_url = Some("https://example.com/t.png".into());

        store.upsert_page(&page).await.unwrap();
        let loaded = store.get_page(&page.id).await.unwrap().unwrap();

        assert_eq!(loaded.title, "Persisted");
        assert_eq!(loaded.content_preview, "First lines");
        assert_eq!(loaded.thumbnail_url, page.thumbnail_url);
        // Millisecond precision survives the round trip.
        assert_eq!(
            loaded.updated_at.timestamp_millis(),
            page.updated_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_delete_page_bumps_updated_at() {
        let store = open_store();
        let page = PageMetadata::new("user-1", "Doomed");
        store.upsert_page(&page).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.delete_page(&page.id).await.unwrap();

        let loaded = store.get_page(&page.id).await.unwrap().unwrap();
        assert!(loaded.is_deleted);
        assert!(loaded.updated_at > page.updated_at);
    }

    #[tokio::test]
    async fn test_save_links_is_transactional_replace() {
        let store = open_store();
        store
            .save_links("a", &[Link::new("a", "b"), Link::new("a", "c")])
            .await
            .unwrap();
        store.save_links("a", &[Link::new("a", "d")]).await.unwrap();

        let links = store.get_links("a").await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target_id, "d");

        // Other sources are untouched by a replacement.
        store.save_links("x", &[Link::new("x", "a")]).await.unwrap();
        store.save_links("a", &[]).await.unwrap();
        assert_eq!(store.get_links("x").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ghost_link_unique_per_text_and_source() {
        let store = open_store();
        store
            .save_ghost_links(
                "a",
                &[GhostLink::new("Target", "a"), GhostLink::new("Target", "a")],
            )
            .await
            .unwrap();

        // INSERT OR REPLACE on the (text, source) key collapses duplicates.
        let ghosts = store.get_ghost_links("a").await.unwrap();
        assert_eq!(ghosts.len(), 1);
    }

    #[tokio::test]
    async fn test_document_blob_round_trip() {
        let store = open_store();
        assert!(store.get_document_state("p").await.unwrap().is_none());

        store.save_document_state("p", &[1, 2, 3], 7).await.unwrap();
        assert_eq!(
            store.get_document_state("p").await.unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(store.get_document_version("p").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_search_via_index_and_title() {
        let store = open_store();
        let by_title = PageMetadata::new("u", "Rust patterns");
        let by_body = PageMetadata::new("u", "Scratch");
        store.upsert_page(&by_title).await.unwrap();
        store.upsert_page(&by_body).await.unwrap();
        store
            .update_search_index(&by_body.id, "notes about rust macros")
            .await
            .unwrap();

        let hits = store.search_pages("RUST").await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_cursor_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        let ts = Utc::now();

        {
            let store = SqliteStore::open(&path).unwrap();
            store.set_last_sync_time(ts).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.get_last_sync_time().await.unwrap().unwrap();
        assert_eq!(loaded.timestamp_millis(), ts.timestamp_millis());
    }
}
