use std::path::Path;

use anyhow::{bail, Context, Result};
use arbor_contracts::records::{FailureInfo, GenerationRecord, GenerationStatus};
use arbor_contracts::session::ChatMessage;
use rusqlite::{params, Connection, OptionalExtension};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS generation_history (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    project_name TEXT,
    raw_user_input TEXT NOT NULL,
    final_prompt TEXT NOT NULL,
    parameters TEXT NOT NULL,
    conversation TEXT NOT NULL,
    status TEXT NOT NULL,
    image_url TEXT,
    thumbnail_url TEXT,
    failure TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

/// Relational store for generation records. The lifecycle manager is the
/// only component that touches it; everything else reads record snapshots.
pub struct RecordStore {
    conn: Connection,
}

impl RecordStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed opening database {}", path.display()))?;
        Self::init(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed opening in-memory database")?;
        Self::init(&conn)?;
        Ok(Self { conn })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute(SCHEMA, [])
            .context("failed creating generation_history table")?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_generation_history_user
             ON generation_history (user_id, created_at)",
            [],
        )
        .context("failed creating generation_history index")?;
        Ok(())
    }

    pub fn insert(&self, record: &GenerationRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO generation_history (
                    id, user_id, project_name, raw_user_input, final_prompt,
                    parameters, conversation, status, image_url, thumbnail_url,
                    failure, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.id,
                    record.user_id,
                    record.project_name,
                    record.raw_user_input,
                    record.final_prompt,
                    serde_json::to_string(&record.parameters)?,
                    serde_json::to_string(&record.conversation)?,
                    record.status.as_str(),
                    record.image_url,
                    record.thumbnail_url,
                    failure_json(record)?,
                    record.created_at,
                    record.updated_at,
                ],
            )
            .with_context(|| format!("failed inserting generation {}", record.id))?;
        Ok(())
    }

    /// Rewrites the mutable columns of a record. `raw_user_input` and
    /// `created_at` are immutable once set and are deliberately excluded.
    pub fn update(&self, record: &GenerationRecord) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE generation_history SET
                    project_name = ?2, final_prompt = ?3, parameters = ?4,
                    conversation = ?5, status = ?6, image_url = ?7,
                    thumbnail_url = ?8, failure = ?9, updated_at = ?10
                 WHERE id = ?1",
                params![
                    record.id,
                    record.project_name,
                    record.final_prompt,
                    serde_json::to_string(&record.parameters)?,
                    serde_json::to_string(&record.conversation)?,
                    record.status.as_str(),
                    record.image_url,
                    record.thumbnail_url,
                    failure_json(record)?,
                    record.updated_at,
                ],
            )
            .with_context(|| format!("failed updating generation {}", record.id))?;
        if rows == 0 {
            bail!("unknown generation {}", record.id);
        }
        Ok(())
    }

    pub fn fetch(&self, id: &str) -> Result<Option<GenerationRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM generation_history WHERE id = ?1"),
                params![id],
                read_raw_row,
            )
            .optional()
            .with_context(|| format!("failed fetching generation {id}"))?;
        raw.map(into_record).transpose()
    }

    pub fn list_for_user(&self, user_id: &str, limit: u32) -> Result<Vec<GenerationRecord>> {
        let mut statement = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM generation_history
             WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = statement
            .query_map(params![user_id, limit], read_raw_row)
            .with_context(|| format!("failed listing generations for {user_id}"))?;

        let mut records = Vec::new();
        for raw in rows {
            records.push(into_record(raw?)?);
        }
        Ok(records)
    }
}

const COLUMNS: &str = "id, user_id, project_name, raw_user_input, final_prompt, parameters, \
                       conversation, status, image_url, thumbnail_url, failure, created_at, \
                       updated_at";

struct RawRow {
    id: String,
    user_id: String,
    project_name: Option<String>,
    raw_user_input: String,
    final_prompt: String,
    parameters: String,
    conversation: String,
    status: String,
    image_url: Option<String>,
    thumbnail_url: Option<String>,
    failure: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        project_name: row.get(2)?,
        raw_user_input: row.get(3)?,
        final_prompt: row.get(4)?,
        parameters: row.get(5)?,
        conversation: row.get(6)?,
        status: row.get(7)?,
        image_url: row.get(8)?,
        thumbnail_url: row.get(9)?,
        failure: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn into_record(raw: RawRow) -> Result<GenerationRecord> {
    let Some(status) = GenerationStatus::parse(&raw.status) else {
        bail!("generation {} has unknown status '{}'", raw.id, raw.status);
    };
    let parameters = serde_json::from_str(&raw.parameters)
        .with_context(|| format!("generation {} has invalid parameters JSON", raw.id))?;
    let conversation: Vec<ChatMessage> = serde_json::from_str(&raw.conversation)
        .with_context(|| format!("generation {} has invalid conversation JSON", raw.id))?;
    let failure: Option<FailureInfo> = raw
        .failure
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .with_context(|| format!("generation {} has invalid failure JSON", raw.id))?;

    Ok(GenerationRecord {
        id: raw.id,
        user_id: raw.user_id,
        project_name: raw.project_name,
        raw_user_input: raw.raw_user_input,
        final_prompt: raw.final_prompt,
        parameters,
        conversation,
        status,
        image_url: raw.image_url,
        thumbnail_url: raw.thumbnail_url,
        failure,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
    })
}

fn failure_json(record: &GenerationRecord) -> Result<Option<String>> {
    record
        .failure
        .as_ref()
        .map(|failure| serde_json::to_string(failure).context("failed serializing failure info"))
        .transpose()
}

#[cfg(test)]
mod tests {
    use arbor_contracts::records::{
        now_utc_iso, FailureInfo, FailureStage, GenerationRecord, GenerationStatus,
    };
    use arbor_contracts::session::ChatMessage;
    use serde_json::{json, Map};

    use super::RecordStore;

    fn record(user: &str) -> GenerationRecord {
        let mut parameters = Map::new();
        parameters.insert("style".to_string(), json!("watercolor"));
        GenerationRecord::new(
            user,
            "a lighthouse at dusk",
            parameters,
            vec![ChatMessage::new("user", "a lighthouse at dusk")],
            None,
        )
    }

    #[test]
    fn insert_and_fetch_round_trips_every_field() -> anyhow::Result<()> {
        let store = RecordStore::open_in_memory()?;
        let mut original = record("u1");
        original.project_name = Some("A Lighthouse At Dusk".to_string());
        original.final_prompt = "a lighthouse at dusk, warm colors".to_string();
        store.insert(&original)?;

        let fetched = store.fetch(&original.id)?.expect("record present");
        assert_eq!(fetched, original);
        Ok(())
    }

    #[test]
    fn fetch_missing_returns_none() -> anyhow::Result<()> {
        let store = RecordStore::open_in_memory()?;
        assert!(store.fetch("nope")?.is_none());
        Ok(())
    }

    #[test]
    fn update_persists_status_and_failure_metadata() -> anyhow::Result<()> {
        let store = RecordStore::open_in_memory()?;
        let mut original = record("u1");
        store.insert(&original)?;

        original.transition(GenerationStatus::Naming)?;
        original.transition(GenerationStatus::Failed)?;
        original.failure = Some(FailureInfo {
            stage: FailureStage::Naming,
            class: "internal".to_string(),
            message: "database went away".to_string(),
            at: now_utc_iso(),
        });
        store.update(&original)?;

        let fetched = store.fetch(&original.id)?.expect("record present");
        assert_eq!(fetched.status, GenerationStatus::Failed);
        assert_eq!(fetched.failure, original.failure);
        Ok(())
    }

    #[test]
    fn raw_user_input_is_immutable_across_updates() -> anyhow::Result<()> {
        let store = RecordStore::open_in_memory()?;
        let original = record("u1");
        store.insert(&original)?;

        let mut tampered = original.clone();
        tampered.raw_user_input = "something else entirely".to_string();
        store.update(&tampered)?;

        let fetched = store.fetch(&original.id)?.expect("record present");
        assert_eq!(fetched.raw_user_input, original.raw_user_input);
        Ok(())
    }

    #[test]
    fn update_of_unknown_record_fails() -> anyhow::Result<()> {
        let store = RecordStore::open_in_memory()?;
        let err = store.update(&record("u1")).unwrap_err();
        assert!(err.to_string().contains("unknown generation"));
        Ok(())
    }

    #[test]
    fn list_for_user_is_newest_first_and_limited() -> anyhow::Result<()> {
        let store = RecordStore::open_in_memory()?;
        for day in 1..=4 {
            let mut entry = record("u1");
            entry.created_at = format!("2026-02-0{day}T10:00:00+00:00");
            store.insert(&entry)?;
        }
        let mut other = record("u2");
        other.created_at = "2026-02-09T10:00:00+00:00".to_string();
        store.insert(&other)?;

        let listed = store.list_for_user("u1", 3)?;
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|entry| entry.user_id == "u1"));
        assert_eq!(listed[0].created_at, "2026-02-04T10:00:00+00:00");
        assert_eq!(listed[2].created_at, "2026-02-02T10:00:00+00:00");
        Ok(())
    }

    #[test]
    fn open_creates_database_file_and_parents() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("arbor.db");
        let store = RecordStore::open(&path)?;
        store.insert(&record("u1"))?;
        assert!(path.exists());
        Ok(())
    }
}
