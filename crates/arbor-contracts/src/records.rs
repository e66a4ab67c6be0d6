use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::StudioError;
use crate::session::ChatMessage;

/// Lifecycle status of one generation request.
///
/// Transitions run forward only:
/// `Pending -> Naming -> Generating -> Storing -> Completed`, with `Failed`
/// reachable from `Naming`, `Generating` and `Storing`. `Completed` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Naming,
    Generating,
    Storing,
    Completed,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Naming => "naming",
            GenerationStatus::Generating => "generating",
            GenerationStatus::Storing => "storing",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(GenerationStatus::Pending),
            "naming" => Some(GenerationStatus::Naming),
            "generating" => Some(GenerationStatus::Generating),
            "storing" => Some(GenerationStatus::Storing),
            "completed" => Some(GenerationStatus::Completed),
            "failed" => Some(GenerationStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, GenerationStatus::Completed | GenerationStatus::Failed)
    }

    pub fn can_transition(self, next: GenerationStatus) -> bool {
        use GenerationStatus::*;
        matches!(
            (self, next),
            (Pending, Naming)
                | (Naming, Generating)
                | (Naming, Failed)
                | (Generating, Storing)
                | (Generating, Failed)
                | (Storing, Completed)
                | (Storing, Failed)
        )
    }
}

impl std::fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage a failed generation died in. The key diagnostic an
/// operator reads off a failed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Naming,
    Generating,
    Storing,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureStage::Naming => "naming",
            FailureStage::Generating => "generating",
            FailureStage::Storing => "storing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub stage: FailureStage,
    pub class: String,
    pub message: String,
    pub at: String,
}

/// Durable record of one generation request, from submission to terminal
/// status. Created and mutated only by the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: String,
    pub user_id: String,
    pub project_name: Option<String>,
    pub raw_user_input: String,
    pub final_prompt: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub conversation: Vec<ChatMessage>,
    pub status: GenerationStatus,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub failure: Option<FailureInfo>,
    pub created_at: String,
    pub updated_at: String,
}

impl GenerationRecord {
    pub fn new(
        user_id: impl Into<String>,
        raw_user_input: impl Into<String>,
        parameters: Map<String, Value>,
        conversation: Vec<ChatMessage>,
        project_name: Option<String>,
    ) -> Self {
        let now = now_utc_iso();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            project_name,
            raw_user_input: raw_user_input.into(),
            final_prompt: String::new(),
            parameters,
            conversation,
            status: GenerationStatus::Pending,
            image_url: None,
            thumbnail_url: None,
            failure: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Moves the record to `next`, stamping `updated_at`. Rejects every edge
    /// outside the state machine without touching the record.
    pub fn transition(&mut self, next: GenerationStatus) -> Result<(), StudioError> {
        if !self.status.can_transition(next) {
            return Err(StudioError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now_utc_iso();
        Ok(())
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
