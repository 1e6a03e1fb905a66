use crate::api::models::{Conversation, ConversationRef, UserId};
use crate::error::{Error, Result};
use directories::ProjectDirs;
use log::warn;
use rusqlite::{Connection, params};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_LIMIT: usize = 500;

/// SQLite snapshot of the durable conversation list, so a restarted client
/// can show something before the first network round trip completes.
/// Placeholders are never cached.
#[derive(Debug, Clone)]
pub struct ConversationCache {
    path: PathBuf,
}

impl ConversationCache {
    pub fn default_location(user_id: UserId) -> Option<PathBuf> {
        let proj = ProjectDirs::from("id", "petid", "PetIdMessenger")?;
        Some(Self::path_for(proj.data_dir(), user_id))
    }

    /// One file per account.
    pub fn path_for(dir: &Path, user_id: UserId) -> PathBuf {
        dir.join(format!("cache-{user_id}.sqlite"))
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let cache = Self { path: path.into() };
        if let Some(parent) = cache.path.parent() {
            fs::create_dir_all(parent)?;
        }
        cache.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                position INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                raw_json TEXT NOT NULL
            );
            "#,
        )?;
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }

    /// Replaces the cached list with `conversations`, keeping their order.
    pub fn store(&self, conversations: &[Conversation]) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Config(e.to_string()))?
            .as_secs() as i64;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM conversations", [])?;
        for (position, conv) in conversations.iter().enumerate() {
            let ConversationRef::Durable(id) = conv.id else {
                continue;
            };
            let raw = serde_json::to_string(conv)?;
            tx.execute(
                r#"
                INSERT INTO conversations (id, title, position, updated_at, raw_json)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET
                    title=excluded.title,
                    position=excluded.position,
                    updated_at=excluded.updated_at,
                    raw_json=excluded.raw_json
                "#,
                params![id, conv.title(), position as i64, now, raw],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load(&self, limit: Option<usize>) -> Result<Vec<Conversation>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, raw_json FROM conversations ORDER BY position ASC LIMIT ?1")?;
        let lim = limit.unwrap_or(DEFAULT_LIMIT) as i64;
        let rows = stmt.query_map(params![lim], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, raw) = row?;
            match serde_json::from_str::<Conversation>(&raw) {
                Ok(conv) if conv.id == ConversationRef::Durable(id) => out.push(conv),
                Ok(_) => warn!("cached conversation {id} does not match its key; skipping"),
                Err(e) => warn!("cached conversation {id} is unreadable: {e}"),
            }
        }
        Ok(out)
    }

    pub fn clear(&self) -> Result<()> {
        self.conn()?.execute("DELETE FROM conversations", [])?;
        Ok(())
    }
}
