use chrono::{DateTime, Utc};

pub const MAX_PROJECT_NAME_CHARS: usize = 50;
const MIN_PROJECT_NAME_CHARS: usize = 3;

/// Derives a display label for a generation from the user's raw input.
///
/// Keeps alphanumerics, spaces and hyphens, collapses whitespace, truncates
/// to 50 characters at a token boundary and title-cases each token. Input
/// that sanitizes down to fewer than 3 characters falls back to a
/// timestamped label, so the result is never empty.
pub fn derive_project_name(raw_input: &str) -> String {
    derive_project_name_at(raw_input, Utc::now())
}

pub fn derive_project_name_at(raw_input: &str, now: DateTime<Utc>) -> String {
    let cleaned: String = raw_input
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == ' ' || *ch == '-' || ch.is_whitespace())
        .collect();

    let mut label = String::new();
    for token in cleaned.split_whitespace() {
        let needed = if label.is_empty() {
            token.chars().count()
        } else {
            token.chars().count() + 1
        };
        if label.chars().count() + needed > MAX_PROJECT_NAME_CHARS {
            break;
        }
        if !label.is_empty() {
            label.push(' ');
        }
        label.push_str(&title_case(token));
    }

    if label.chars().count() < MIN_PROJECT_NAME_CHARS {
        return fallback_name(now);
    }
    label
}

fn title_case(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
        None => String::new(),
    }
}

fn fallback_name(now: DateTime<Utc>) -> String {
    format!("Generation {}", now.format("%Y%m%d_%H%M%S"))
}
