use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::StudioError;
use crate::records::now_utc_iso;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub timestamp: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: Some(now_utc_iso()),
        }
    }
}

/// Ephemeral per-user conversation state. Lives only in the session cache;
/// a generation snapshots the transcript into its own durable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub conversation_id: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub prompt_state: Map<String, Value>,
    pub created_at: String,
}

impl Session {
    pub fn new() -> Self {
        Self {
            conversation_id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            prompt_state: Map::new(),
            created_at: now_utc_iso(),
        }
    }

    pub fn push_message(&mut self, role: &str, content: &str) {
        self.messages.push(ChatMessage::new(role, content));
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    last_active: String,
    session: Session,
}

/// File-backed session store keyed by user, with a sliding idle window.
///
/// Every successful `get`/`put`/`touch` refreshes the entry's TTL; an entry
/// idle past the window is purged and reported as absent, never as a
/// default-initialized session. Concurrent writers are last-write-wins.
#[derive(Debug, Clone)]
pub struct SessionCache {
    path: PathBuf,
    idle_ttl: Duration,
}

pub const DEFAULT_IDLE_TTL_SECS: i64 = 3600;

impl SessionCache {
    pub fn new(path: impl Into<PathBuf>, idle_ttl_secs: i64) -> Self {
        Self {
            path: path.into(),
            idle_ttl: Duration::seconds(idle_ttl_secs.max(1)),
        }
    }

    pub fn put(&self, user: &str, session: &Session) -> Result<(), StudioError> {
        self.put_at(user, session, Utc::now())
    }

    pub fn get(&self, user: &str) -> Result<Option<Session>, StudioError> {
        self.get_at(user, Utc::now())
    }

    pub fn touch(&self, user: &str) -> Result<bool, StudioError> {
        self.touch_at(user, Utc::now())
    }

    pub fn delete(&self, user: &str) -> Result<(), StudioError> {
        let mut entries = self.load()?;
        if entries.remove(user).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }

    /// Drops every entry idle past the window. Returns how many were removed.
    pub fn sweep_expired(&self) -> Result<usize, StudioError> {
        self.sweep_expired_at(Utc::now())
    }

    fn put_at(&self, user: &str, session: &Session, now: DateTime<Utc>) -> Result<(), StudioError> {
        let mut entries = self.load()?;
        entries.insert(
            user.to_string(),
            CacheEntry {
                last_active: iso(now),
                session: session.clone(),
            },
        );
        self.flush(&entries)
    }

    fn get_at(&self, user: &str, now: DateTime<Utc>) -> Result<Option<Session>, StudioError> {
        let mut entries = self.load()?;
        let Some(entry) = entries.get_mut(user) else {
            return Ok(None);
        };
        if self.is_expired(&entry.last_active, now) {
            entries.remove(user);
            self.flush(&entries)?;
            return Ok(None);
        }
        entry.last_active = iso(now);
        let session = entry.session.clone();
        self.flush(&entries)?;
        Ok(Some(session))
    }

    fn touch_at(&self, user: &str, now: DateTime<Utc>) -> Result<bool, StudioError> {
        let mut entries = self.load()?;
        let Some(entry) = entries.get_mut(user) else {
            return Ok(false);
        };
        if self.is_expired(&entry.last_active, now) {
            entries.remove(user);
            self.flush(&entries)?;
            return Ok(false);
        }
        entry.last_active = iso(now);
        self.flush(&entries)?;
        Ok(true)
    }

    fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<usize, StudioError> {
        let mut entries = self.load()?;
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(&entry.last_active, now));
        let removed = before - entries.len();
        if removed > 0 {
            self.flush(&entries)?;
        }
        Ok(removed)
    }

    fn is_expired(&self, last_active: &str, now: DateTime<Utc>) -> bool {
        match DateTime::parse_from_rfc3339(last_active) {
            Ok(stamp) => now.signed_duration_since(stamp.with_timezone(&Utc)) > self.idle_ttl,
            // An unreadable stamp counts as expired rather than immortal.
            Err(_) => true,
        }
    }

    fn load(&self) -> Result<std::collections::BTreeMap<String, CacheEntry>, StudioError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Default::default()),
            Err(err) => return Err(unavailable(&self.path, err)),
        };
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    }

    fn flush(
        &self,
        entries: &std::collections::BTreeMap<String, CacheEntry>,
    ) -> Result<(), StudioError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| unavailable(&self.path, err))?;
        }
        let payload =
            serde_json::to_string_pretty(entries).map_err(|err| StudioError::CacheUnavailable {
                reason: err.to_string(),
            })?;
        std::fs::write(&self.path, payload).map_err(|err| unavailable(&self.path, err))
    }
}

fn unavailable(path: &Path, err: std::io::Error) -> StudioError {
    StudioError::CacheUnavailable {
        reason: format!("{}: {err}", path.display()),
    }
}

fn iso(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}
