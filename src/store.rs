use anyhow::{Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

const TOKEN_LEN: usize = 12;

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub token: String,
    pub url: String,
    pub interval: u64,
    pub created_at: i64,
}

/// Persistent subscription records keyed by token. The connection mutex
/// serializes access; every operation is a single short statement.
pub struct SubscriptionStore {
    conn: Mutex<Connection>,
}

impl SubscriptionStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn =
            Connection::open(path).with_context(|| format!("failed to open store at {path}"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        info!("Subscription store ready at {path}");
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS subscriptions (
              token TEXT PRIMARY KEY,
              snapshot_url TEXT NOT NULL,
              interval_sec INTEGER NOT NULL,
              created_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Insert a new record under a freshly issued token.
    pub fn create(&self, url: &str, interval_sec: u64) -> Result<String> {
        let token = new_token(TOKEN_LEN);
        let created_at = unix_now();
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO subscriptions(token, snapshot_url, interval_sec, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![token, url, interval_sec, created_at],
        )?;
        Ok(token)
    }

    pub fn list(&self) -> Result<Vec<Subscription>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare("SELECT token, snapshot_url, interval_sec, created_at FROM subscriptions")?;
        let rows = stmt.query_map([], |row| {
            Ok(Subscription {
                token: row.get(0)?,
                url: row.get(1)?,
                interval: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        let mut subscriptions = Vec::new();
        for row in rows {
            subscriptions.push(row?);
        }
        Ok(subscriptions)
    }

    pub fn get(&self, token: &str) -> Result<Option<Subscription>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT token, snapshot_url, interval_sec, created_at FROM subscriptions WHERE token = ?1",
        )?;
        let mut rows = stmt.query(params![token])?;
        match rows.next()? {
            Some(row) => Ok(Some(Subscription {
                token: row.get(0)?,
                url: row.get(1)?,
                interval: row.get(2)?,
                created_at: row.get(3)?,
            })),
            None => Ok(None),
        }
    }

    /// Returns false when no record matched the token.
    pub fn delete(&self, token: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let deleted = conn.execute("DELETE FROM subscriptions WHERE token = ?1", params![token])?;
        Ok(deleted > 0)
    }
}

fn new_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, SubscriptionStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("subs.db");
        let store = SubscriptionStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn create_then_get_roundtrips() {
        let (_dir, store) = open_store();
        let token = store.create("http://cam/snap.jpg", 5).unwrap();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));

        let sub = store.get(&token).unwrap().expect("record exists");
        assert_eq!(sub.url, "http://cam/snap.jpg");
        assert_eq!(sub.interval, 5);
        assert!(sub.created_at > 0);
    }

    #[test]
    fn list_returns_all_records() {
        let (_dir, store) = open_store();
        store.create("http://cam/a.jpg", 1).unwrap();
        store.create("http://cam/b.jpg", 2).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn delete_reports_missing_token() {
        let (_dir, store) = open_store();
        let token = store.create("http://cam/snap.jpg", 1).unwrap();
        assert!(store.delete(&token).unwrap());
        assert!(!store.delete(&token).unwrap());
        assert!(store.get(&token).unwrap().is_none());
    }

    #[test]
    fn tokens_are_unique_enough() {
        let a = new_token(TOKEN_LEN);
        let b = new_token(TOKEN_LEN);
        assert_ne!(a, b);
    }
}
