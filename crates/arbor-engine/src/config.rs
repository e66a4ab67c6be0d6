use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackendKind {
    Local,
    Remote,
}

/// Runtime configuration, read once from the environment.
///
/// Provider and model selection are plain configuration values; nothing in
/// the engine defaults to a specific remote model identity. With no
/// environment set, the studio runs fully offline: preview image provider,
/// silent chat provider, local blob storage under `./data`.
#[derive(Debug, Clone)]
pub struct StudioConfig {
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub session_cache_path: PathBuf,
    pub events_path: PathBuf,
    pub session_ttl_secs: i64,
    pub storage_backend: StorageBackendKind,
    pub storage_root: PathBuf,
    pub remote_storage_url: Option<String>,
    pub remote_storage_key: Option<String>,
    pub remote_bucket: String,
    pub image_provider: String,
    pub image_model: Option<String>,
    pub chat_model: Option<String>,
    pub api_key: Option<String>,
    pub max_attempts: u32,
}

impl StudioConfig {
    pub fn from_env() -> Self {
        let data_dir = non_empty_env("ARBOR_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        Self {
            database_path: non_empty_env("ARBOR_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("arbor.db")),
            session_cache_path: non_empty_env("ARBOR_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("sessions.json")),
            events_path: non_empty_env("ARBOR_EVENTS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("events.jsonl")),
            session_ttl_secs: ttl_secs(non_empty_env("ARBOR_SESSION_TTL_SECS")),
            storage_backend: backend_kind(non_empty_env("ARBOR_STORAGE_BACKEND")),
            storage_root: non_empty_env("ARBOR_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("images")),
            remote_storage_url: non_empty_env("ARBOR_REMOTE_STORAGE_URL"),
            remote_storage_key: non_empty_env("ARBOR_REMOTE_STORAGE_KEY"),
            remote_bucket: non_empty_env("ARBOR_REMOTE_BUCKET")
                .unwrap_or_else(|| "arbor_images".to_string()),
            image_provider: non_empty_env("ARBOR_IMAGE_PROVIDER")
                .unwrap_or_else(|| "preview".to_string()),
            image_model: non_empty_env("ARBOR_IMAGE_MODEL"),
            chat_model: non_empty_env("ARBOR_CHAT_MODEL"),
            api_key: non_empty_env("ARBOR_API_KEY"),
            max_attempts: max_attempts(non_empty_env("ARBOR_MAX_ATTEMPTS")),
            data_dir,
        }
    }
}

fn ttl_secs(raw: Option<String>) -> i64 {
    raw.and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(arbor_contracts::session::DEFAULT_IDLE_TTL_SECS)
}

fn backend_kind(raw: Option<String>) -> StorageBackendKind {
    match raw.as_deref() {
        Some("remote") => StorageBackendKind::Remote,
        _ => StorageBackendKind::Local,
    }
}

fn max_attempts(raw: Option<String>) -> u32 {
    raw.and_then(|value| value.parse::<u32>().ok())
        .map(|value| value.clamp(1, 10))
        .unwrap_or(3)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::{backend_kind, max_attempts, ttl_secs, StorageBackendKind};

    #[test]
    fn ttl_parses_and_rejects_nonsense() {
        assert_eq!(ttl_secs(Some("600".to_string())), 600);
        assert_eq!(ttl_secs(Some("0".to_string())), 3600);
        assert_eq!(ttl_secs(Some("later".to_string())), 3600);
        assert_eq!(ttl_secs(None), 3600);
    }

    #[test]
    fn backend_defaults_to_local() {
        assert_eq!(backend_kind(None), StorageBackendKind::Local);
        assert_eq!(
            backend_kind(Some("remote".to_string())),
            StorageBackendKind::Remote
        );
        assert_eq!(
            backend_kind(Some("supabase".to_string())),
            StorageBackendKind::Local
        );
    }

    #[test]
    fn attempt_budget_is_clamped() {
        assert_eq!(max_attempts(None), 3);
        assert_eq!(max_attempts(Some("5".to_string())), 5);
        assert_eq!(max_attempts(Some("0".to_string())), 1);
        assert_eq!(max_attempts(Some("99".to_string())), 10);
    }
}
