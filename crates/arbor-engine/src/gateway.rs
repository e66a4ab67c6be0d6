use std::io::Cursor;
use std::thread;
use std::time::Duration;

use arbor_contracts::errors::{FailureClass, StudioError};
use image::{ImageFormat, Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::{push_unique_warning, truncate_text};

const REQUEST_TIMEOUT_SECS: u64 = 90;

/// A single failed synthesis attempt, classified for retry purposes.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub class: FailureClass,
    pub message: String,
}

impl ProviderFailure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(
        &self,
        prompt: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Vec<u8>, ProviderFailure>;
}

/// Bounded-attempt budget with exponential doubling backoff, capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the given 1-based failed attempt:
    /// `base * 2^(attempt-1)`, never above `max_delay`.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(exponent));
        delay.min(self.max_delay)
    }
}

/// Retry/backoff wrapper around one upstream image provider.
///
/// Stateless apart from wall-clock sleeps; knows nothing about generation
/// records. Transient failure classes consume the attempt budget, terminal
/// classes abort immediately, and exhaustion surfaces the last cause with
/// the attempt count.
pub struct ImageGateway {
    provider: Box<dyn ImageProvider>,
    policy: RetryPolicy,
}

impl ImageGateway {
    pub fn new(provider: Box<dyn ImageProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn generate(
        &self,
        prompt: &str,
        parameters: &Map<String, Value>,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<u8>, StudioError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_failure: Option<ProviderFailure> = None;

        for attempt in 1..=max_attempts {
            match self.provider.generate(prompt, parameters) {
                Ok(bytes) => return Ok(bytes),
                Err(failure) if !failure.class.is_retryable() => {
                    return Err(StudioError::GenerationFailed {
                        attempts: attempt,
                        class: failure.class,
                        cause: failure.message,
                    });
                }
                Err(failure) => {
                    if attempt < max_attempts {
                        let delay = self.policy.delay_after(attempt);
                        push_unique_warning(
                            warnings,
                            format!(
                                "image attempt {attempt}/{max_attempts} failed ({}): {}; retrying in {:.1}s",
                                failure.class,
                                failure.message,
                                delay.as_secs_f64()
                            ),
                        );
                        thread::sleep(delay);
                    }
                    last_failure = Some(failure);
                }
            }
        }

        let failure = last_failure.unwrap_or_else(|| {
            ProviderFailure::new(FailureClass::Upstream, "no attempt was made")
        });
        Err(StudioError::GenerationFailed {
            attempts: max_attempts,
            class: failure.class,
            cause: failure.message,
        })
    }
}

/// Image synthesis over the Gemini `generateContent` surface. The model id
/// is pure configuration; nothing here assumes a particular family.
pub struct GeminiProvider {
    http: HttpClient,
    model: String,
    api_key: String,
}

impl GeminiProvider {
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

    fn extract_image_bytes(payload: &Value) -> Result<Vec<u8>, ProviderFailure> {
        if let Some(reason) = blocked_reason(payload) {
            return Err(ProviderFailure::new(
                FailureClass::ContentPolicy,
                format!("response blocked by content policy ({reason})"),
            ));
        }

        let candidates = payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                let data = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                    .and_then(|inline| inline.get("data"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                use base64::Engine as _;
                return base64::engine::general_purpose::STANDARD
                    .decode(data.as_bytes())
                    .map_err(|err| {
                        ProviderFailure::new(
                            FailureClass::Upstream,
                            format!("image payload base64 decode failed: {err}"),
                        )
                    });
            }
        }

        Err(ProviderFailure::new(
            FailureClass::Upstream,
            "no image data in response",
        ))
    }
}

impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(
        &self,
        prompt: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Vec<u8>, ProviderFailure> {
        let full_prompt = prompt_with_style(prompt, parameters);
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": full_prompt}],
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
            },
        });

        let response = self
            .http
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .json(&payload)
            .send()
            .map_err(classify_transport_error)?;

        let status = response.status().as_u16();
        let body = response.text().map_err(|err| {
            ProviderFailure::new(
                FailureClass::Upstream,
                format!("response body read failed: {err}"),
            )
        })?;
        if !(200..300).contains(&status) {
            return Err(ProviderFailure::new(
                class_for_status(status),
                format!(
                    "image request failed ({status}): {}",
                    truncate_text(&body, 512)
                ),
            ));
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            ProviderFailure::new(
                FailureClass::Upstream,
                format!("invalid JSON payload: {err}"),
            )
        })?;
        Self::extract_image_bytes(&parsed)
    }
}

/// Offline provider deriving a deterministic flat-color image from the
/// prompt. Gives the pipeline an end-to-end path without any network.
pub struct PreviewProvider;

impl ImageProvider for PreviewProvider {
    fn name(&self) -> &str {
        "preview"
    }

    fn generate(
        &self,
        prompt: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Vec<u8>, ProviderFailure> {
        let size = parameters
            .get("size")
            .and_then(Value::as_str)
            .unwrap_or("512x512");
        let (width, height) = parse_dims(size);
        let full_prompt = prompt_with_style(prompt, parameters);
        let (r, g, b) = color_from_prompt(&full_prompt);

        let mut canvas = RgbImage::new(width, height);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(canvas)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|err| {
                ProviderFailure::new(
                    FailureClass::Upstream,
                    format!("preview image encode failed: {err}"),
                )
            })?;
        Ok(bytes)
    }
}

fn prompt_with_style(prompt: &str, parameters: &Map<String, Value>) -> String {
    match parameters.get("style").and_then(Value::as_str) {
        Some(style) if !style.trim().is_empty() => format!("{prompt}, {} style", style.trim()),
        _ => prompt.to_string(),
    }
}

fn classify_transport_error(err: reqwest::Error) -> ProviderFailure {
    let class = if err.is_timeout() {
        FailureClass::Timeout
    } else {
        FailureClass::Upstream
    };
    ProviderFailure::new(class, format!("image request failed: {err}"))
}

fn class_for_status(status: u16) -> FailureClass {
    match status {
        408 => FailureClass::Timeout,
        429 => FailureClass::RateLimited,
        400 | 404 | 422 => FailureClass::InvalidArgument,
        _ => FailureClass::Upstream,
    }
}

fn blocked_reason(payload: &Value) -> Option<String> {
    if let Some(reason) = payload
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
    {
        return Some(reason.to_string());
    }
    let candidates = payload.get("candidates").and_then(Value::as_array)?;
    for candidate in candidates {
        let reason = candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if matches!(
            reason,
            "SAFETY" | "IMAGE_SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST"
        ) {
            return Some(reason.to_string());
        }
    }
    None
}

fn parse_dims(size: &str) -> (u32, u32) {
    let mut parts = size.split('x');
    let width = parts
        .next()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(512);
    let height = parts
        .next()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(512);
    (width.min(4096), height.min(4096))
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use arbor_contracts::errors::{FailureClass, StudioError};
    use serde_json::{json, Map, Value};

    use super::{
        parse_dims, ImageGateway, ImageProvider, PreviewProvider, ProviderFailure, RetryPolicy,
    };

    struct FlakyProvider {
        failures_left: Mutex<u32>,
        calls: Arc<Mutex<u32>>,
        class: FailureClass,
    }

    impl FlakyProvider {
        fn new(failures: u32, class: FailureClass) -> Self {
            Self {
                failures_left: Mutex::new(failures),
                calls: Arc::new(Mutex::new(0)),
                class,
            }
        }

        fn call_counter(&self) -> Arc<Mutex<u32>> {
            Arc::clone(&self.calls)
        }
    }

    impl ImageProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        fn generate(
            &self,
            prompt: &str,
            parameters: &Map<String, Value>,
        ) -> Result<Vec<u8>, ProviderFailure> {
            *self.calls.lock().unwrap() += 1;
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(ProviderFailure::new(self.class, "induced failure"));
            }
            PreviewProvider.generate(prompt, parameters)
        }
    }

    fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn recovers_after_transient_failures() {
        let gateway = ImageGateway::new(
            Box::new(FlakyProvider::new(2, FailureClass::Timeout)),
            instant_policy(3),
        );
        let mut warnings = Vec::new();
        let bytes = gateway.generate("a cat", &Map::new(), &mut warnings).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("attempt 1/3"));
    }

    #[test]
    fn exhausted_retries_report_attempt_count_and_last_cause() {
        let provider = FlakyProvider::new(99, FailureClass::Upstream);
        let gateway = ImageGateway::new(Box::new(provider), instant_policy(3));
        let mut warnings = Vec::new();
        let err = gateway
            .generate("a cat", &Map::new(), &mut warnings)
            .unwrap_err();
        match err {
            StudioError::GenerationFailed {
                attempts,
                class,
                cause,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(class, FailureClass::Upstream);
                assert!(cause.contains("induced failure"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn non_retryable_failure_spends_no_retry_budget() {
        let provider = FlakyProvider::new(99, FailureClass::ContentPolicy);
        let calls = provider.call_counter();
        let gateway = ImageGateway::new(Box::new(provider), instant_policy(3));
        let mut warnings = Vec::new();
        let err = gateway
            .generate("a cat", &Map::new(), &mut warnings)
            .unwrap_err();
        match err {
            StudioError::GenerationFailed { attempts, class, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(class, FailureClass::ContentPolicy);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(warnings.is_empty());
    }

    #[test]
    fn attempt_budget_bounds_provider_calls() {
        let provider = FlakyProvider::new(99, FailureClass::RateLimited);
        let calls = provider.call_counter();
        let gateway = ImageGateway::new(Box::new(provider), instant_policy(4));
        let mut warnings = Vec::new();
        let _ = gateway.generate("a cat", &Map::new(), &mut warnings);
        assert_eq!(*calls.lock().unwrap(), 4);
        assert_eq!(warnings.len(), 3);
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
        };
        let delays: Vec<Duration> = (1..=5).map(|attempt| policy.delay_after(attempt)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[2], Duration::from_secs(2));
        assert_eq!(delays[4], Duration::from_secs(2));
    }

    #[test]
    fn preview_provider_is_deterministic() {
        let first = PreviewProvider.generate("a red fox", &Map::new()).unwrap();
        let second = PreviewProvider.generate("a red fox", &Map::new()).unwrap();
        assert_eq!(first, second);

        let other = PreviewProvider.generate("a blue fox", &Map::new()).unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn preview_provider_honors_size_parameter() {
        let mut parameters = Map::new();
        parameters.insert("size".to_string(), json!("640x360"));
        let bytes = PreviewProvider.generate("skyline", &parameters).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 640);
        assert_eq!(decoded.height(), 360);
    }

    #[test]
    fn style_parameter_changes_the_preview_output() {
        let mut parameters = Map::new();
        parameters.insert("style".to_string(), json!("watercolor"));
        let styled = PreviewProvider.generate("a red fox", &parameters).unwrap();
        let plain = PreviewProvider.generate("a red fox", &Map::new()).unwrap();
        assert_ne!(styled, plain);
    }

    #[test]
    fn dims_parse_with_defaults() {
        assert_eq!(parse_dims("1024x768"), (1024, 768));
        assert_eq!(parse_dims("banana"), (512, 512));
        assert_eq!(parse_dims("0x0"), (512, 512));
    }
}
