use std::time::Duration;

use anyhow::{bail, Context, Result};
use arbor_contracts::errors::StudioError;
use arbor_contracts::events::EventWriter;
use arbor_contracts::session::{ChatMessage, Session, SessionCache};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

use crate::truncate_text;

/// Deterministic guidance used whenever the conversational collaborator
/// returns nothing usable. Keeps the turn alive instead of failing it.
pub const FALLBACK_QUESTION: &str = "Can you tell me more about what you're envisioning?";

const CHAT_TIMEOUT_SECS: u64 = 60;

/// Opaque conversational collaborator: ordered transcript in, text out.
/// An empty reply means the response was blocked or empty upstream; callers
/// substitute the fallback question.
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;
    fn reply(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// Text replies over the Gemini `generateContent` surface. Model id is pure
/// configuration.
pub struct GeminiChatProvider {
    http: HttpClient,
    model: String,
    api_key: String,
}

impl GeminiChatProvider {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: HttpClient::new(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        )
    }
}

impl ChatProvider for GeminiChatProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn reply(&self, messages: &[ChatMessage]) -> Result<String> {
        let contents: Vec<Value> = messages
            .iter()
            .map(|message| {
                let role = if message.role == "assistant" {
                    "model"
                } else {
                    "user"
                };
                json!({
                    "role": role,
                    "parts": [{"text": message.content}],
                })
            })
            .collect();

        let response = self
            .http
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .timeout(Duration::from_secs(CHAT_TIMEOUT_SECS))
            .json(&json!({"contents": contents}))
            .send()
            .context("chat request failed")?;

        let status = response.status();
        let body = response.text().context("chat response body read failed")?;
        if !status.is_success() {
            bail!(
                "chat request failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }

        let payload: Value =
            serde_json::from_str(&body).context("chat returned invalid JSON payload")?;
        Ok(extract_text(&payload))
    }
}

/// Stand-in collaborator for keyless runs. Always replies empty, so the
/// assistant falls back to its deterministic guidance.
pub struct OfflineChatProvider;

impl ChatProvider for OfflineChatProvider {
    fn name(&self) -> &str {
        "offline"
    }

    fn reply(&self, _messages: &[ChatMessage]) -> Result<String> {
        Ok(String::new())
    }
}

/// Carries the multi-turn question flow: per-user session state in the
/// cache, the collaborator's replies, and the structured answers collected
/// along the way. A turn never fails because the cache or the collaborator
/// is down; both degrade with a warning event.
pub struct PromptAssistant {
    cache: SessionCache,
    provider: Box<dyn ChatProvider>,
    events: EventWriter,
}

impl PromptAssistant {
    pub fn new(cache: SessionCache, provider: Box<dyn ChatProvider>, events: EventWriter) -> Self {
        Self {
            cache,
            provider,
            events,
        }
    }

    /// Loads the user's live session, or starts a fresh empty one when the
    /// key is absent, expired, or the cache is unreachable.
    pub fn session(&self, user: &str) -> Session {
        match self.cache.get(user) {
            Ok(Some(session)) => session,
            Ok(None) => Session::new(),
            Err(err) => {
                self.warn_cache(user, &err);
                Session::new()
            }
        }
    }

    /// One conversational turn: append the user message, obtain the
    /// assistant reply (fallback question when empty/blocked/erroring),
    /// persist the session. Returns the updated session and the reply.
    pub fn step(&self, user: &str, input: &str) -> Result<(Session, String)> {
        let mut session = self.session(user);
        session.push_message("user", input);

        let reply = match self.provider.reply(&session.messages) {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                self.events.warning(
                    "chat_fallback",
                    map_object(json!({
                        "user_id": user,
                        "reason": "empty or blocked reply",
                    })),
                )?;
                FALLBACK_QUESTION.to_string()
            }
            Err(err) => {
                self.events.warning(
                    "chat_fallback",
                    map_object(json!({
                        "user_id": user,
                        "reason": format!("{err:#}"),
                    })),
                )?;
                FALLBACK_QUESTION.to_string()
            }
        };

        session.push_message("assistant", &reply);
        self.save(user, &session);
        Ok((session, reply))
    }

    /// Records one structured answer into the session's prompt state.
    pub fn set_answer(&self, user: &str, key: &str, value: Value) -> Session {
        let mut session = self.session(user);
        session.prompt_state.insert(key.to_string(), value);
        self.save(user, &session);
        session
    }

    pub fn reset(&self, user: &str) {
        if let Err(err) = self.cache.delete(user) {
            self.warn_cache(user, &err);
        }
    }

    fn save(&self, user: &str, session: &Session) {
        if let Err(err) = self.cache.put(user, session) {
            self.warn_cache(user, &err);
        }
    }

    fn warn_cache(&self, user: &str, err: &StudioError) {
        let _ = self.events.warning(
            "cache_unavailable",
            map_object(json!({
                "user_id": user,
                "reason": err.to_string(),
            })),
        );
    }
}

/// Assembles the final synthesis prompt from the raw request and the
/// structured answers collected during the conversation.
pub fn compile_prompt(raw_input: &str, prompt_state: &Map<String, Value>) -> String {
    let mut parts = Vec::new();
    let base = raw_input.trim();
    if !base.is_empty() {
        parts.push(base.to_string());
    }

    // Well-known fields first, in a stable order, then anything else.
    const KNOWN: [&str; 6] = [
        "subject",
        "mood",
        "environment",
        "composition",
        "color_palette",
        "lighting",
    ];
    for key in KNOWN {
        if let Some(value) = prompt_state.get(key) {
            push_labeled(&mut parts, key, value);
        }
    }
    for (key, value) in prompt_state {
        if !KNOWN.contains(&key.as_str()) {
            push_labeled(&mut parts, key, value);
        }
    }

    parts.join(", ")
}

fn push_labeled(parts: &mut Vec<String>, key: &str, value: &Value) {
    let text = value_text(value);
    if text.is_empty() {
        return;
    }
    parts.push(format!("{}: {text}", label_for(key)));
}

fn label_for(key: &str) -> String {
    let spaced = key.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => spaced,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_text)
            .filter(|item| !item.is_empty())
            .collect::<Vec<String>>()
            .join(", "),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        _ => String::new(),
    }
}

fn extract_text(payload: &Value) -> String {
    let candidates = payload
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut out = Vec::new();
    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(Value::as_object)
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    out.push(text.trim().to_string());
                }
            }
        }
    }
    out.join("\n")
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
