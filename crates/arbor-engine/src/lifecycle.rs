use anyhow::{Context, Result};
use arbor_contracts::errors::StudioError;
use arbor_contracts::events::EventWriter;
use arbor_contracts::naming::derive_project_name;
use arbor_contracts::records::{
    now_utc_iso, FailureInfo, FailureStage, GenerationRecord, GenerationStatus,
};
use arbor_contracts::session::ChatMessage;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::db::RecordStore;
use crate::gateway::ImageGateway;
use crate::store::ArtifactStore;

/// Drives a generation request through its state machine and owns the
/// persisted record. Sole writer of the record's status; every stage is
/// persisted before the next one runs, so a crash mid-flow leaves an
/// auditable row instead of nothing.
pub struct GenerationLifecycle {
    store: RecordStore,
    gateway: ImageGateway,
    artifacts: ArtifactStore,
    events: EventWriter,
}

impl GenerationLifecycle {
    pub fn new(
        store: RecordStore,
        gateway: ImageGateway,
        artifacts: ArtifactStore,
        events: EventWriter,
    ) -> Self {
        Self {
            store,
            gateway,
            artifacts,
            events,
        }
    }

    pub fn events(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn create(
        &self,
        user_id: &str,
        raw_input: &str,
        parameters: Map<String, Value>,
        transcript: Vec<ChatMessage>,
        explicit_label: Option<String>,
    ) -> Result<GenerationRecord> {
        let record = GenerationRecord::new(
            user_id,
            raw_input,
            parameters,
            transcript,
            explicit_label.filter(|label| !label.trim().is_empty()),
        );
        self.store.insert(&record)?;
        self.events.info(
            "generation_created",
            map_object(json!({
                "generation_id": record.id,
                "user_id": record.user_id,
            })),
        )?;
        Ok(record)
    }

    /// `pending -> naming -> generating`. Derives the display label when no
    /// explicit one was given at creation.
    pub fn begin(&self, generation_id: &str) -> Result<GenerationRecord> {
        let mut record = self.require(generation_id)?;
        record.transition(GenerationStatus::Naming)?;
        if record
            .project_name
            .as_deref()
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .is_none()
        {
            record.project_name = Some(derive_project_name(&record.raw_user_input));
            self.events.info(
                "name_derived",
                map_object(json!({
                    "generation_id": record.id,
                    "project_name": record.project_name,
                })),
            )?;
        }
        self.store.update(&record)?;

        record.transition(GenerationStatus::Generating)?;
        self.store.update(&record)?;
        self.events.info(
            "generation_started",
            map_object(json!({
                "generation_id": record.id,
                "provider": self.gateway.provider_name(),
            })),
        )?;
        Ok(record)
    }

    /// Runs the synthesis call and persists the artifacts. Always returns a
    /// terminal record (`completed` with both locators, or `failed` with
    /// failure metadata); `Err` is reserved for infrastructure faults and
    /// illegal transitions. Calling it again on a terminal record is a
    /// no-op.
    pub fn execute(&self, generation_id: &str, prompt: &str) -> Result<GenerationRecord> {
        let mut record = self.require(generation_id)?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        if record.status != GenerationStatus::Generating {
            return Err(StudioError::InvalidTransition {
                from: record.status,
                to: GenerationStatus::Storing,
            }
            .into());
        }

        record.final_prompt = prompt.to_string();
        self.store.update(&record)?;

        let mut warnings = Vec::new();
        let image_bytes = match self
            .gateway
            .generate(prompt, &record.parameters, &mut warnings)
        {
            Ok(bytes) => bytes,
            Err(err) => {
                self.emit_warnings(&record.id, &warnings)?;
                return self.fail(record, FailureStage::Generating, err);
            }
        };

        record.transition(GenerationStatus::Storing)?;
        self.store.update(&record)?;

        let (image_url, thumbnail_url) =
            match self.artifacts.store(&record.id, &image_bytes, &mut warnings) {
                Ok(locators) => locators,
                Err(err) => {
                    self.emit_warnings(&record.id, &warnings)?;
                    return self.fail(record, FailureStage::Storing, err);
                }
            };

        record.transition(GenerationStatus::Completed)?;
        record.image_url = Some(image_url.clone());
        record.thumbnail_url = Some(thumbnail_url.clone());
        self.store.update(&record)?;
        self.emit_warnings(&record.id, &warnings)?;
        self.events.info(
            "generation_completed",
            map_object(json!({
                "generation_id": record.id,
                "image_url": image_url,
                "thumbnail_url": thumbnail_url,
                "image_sha256": content_digest(&image_bytes),
            })),
        )?;
        Ok(record)
    }

    pub fn get(&self, generation_id: &str) -> Result<Option<GenerationRecord>> {
        self.store.fetch(generation_id)
    }

    pub fn list_for_user(&self, user_id: &str, limit: u32) -> Result<Vec<GenerationRecord>> {
        self.store.list_for_user(user_id, limit)
    }

    fn fail(
        &self,
        mut record: GenerationRecord,
        stage: FailureStage,
        err: StudioError,
    ) -> Result<GenerationRecord> {
        record.transition(GenerationStatus::Failed)?;
        let (class, attempts) = match &err {
            StudioError::GenerationFailed {
                class, attempts, ..
            } => (class.as_str().to_string(), Some(*attempts)),
            StudioError::StorageFailed { .. } => ("storage".to_string(), None),
            _ => ("internal".to_string(), None),
        };
        record.failure = Some(FailureInfo {
            stage,
            class: class.clone(),
            message: err.to_string(),
            at: now_utc_iso(),
        });
        self.store.update(&record)?;

        let mut payload = map_object(json!({
            "generation_id": record.id,
            "stage": stage.as_str(),
            "class": class,
            "message": err.to_string(),
        }));
        if let Some(attempts) = attempts {
            payload.insert("attempts".to_string(), json!(attempts));
        }
        self.events.error("generation_failed", payload)?;
        Ok(record)
    }

    fn emit_warnings(&self, generation_id: &str, warnings: &[String]) -> Result<()> {
        for warning in warnings {
            self.events.warning(
                "generation_warning",
                map_object(json!({
                    "generation_id": generation_id,
                    "message": warning,
                })),
            )?;
        }
        Ok(())
    }

    fn require(&self, generation_id: &str) -> Result<GenerationRecord> {
        self.store
            .fetch(generation_id)?
            .with_context(|| format!("unknown generation {generation_id}"))
    }
}

fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
