// Logging utilities
// Structured logging with JSON and human-readable formats

use log::Level;
use regex::Regex;
use serde_json::json;
use std::sync::OnceLock;

/// Mask sensitive data in logs
pub fn mask_sensitive(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }

    let visible = 4;
    let start: String = chars[..visible].iter().collect();
    let end: String = chars[chars.len() - visible..].iter().collect();
    format!("{}...{}", start, end)
}

/// Mask `user:password@` in a URL, keeping scheme/host/path visible for troubleshooting.
pub fn mask_url_credentials(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            if !parsed.username().is_empty() {
                let masked = mask_sensitive(parsed.username());
                let _ = parsed.set_username(&masked);
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}

/// Parse log message for `[PHASE: ...]` and `[STEP: ...]` markers.
/// Returns (phase, step, cleaned_message).
pub fn parse_log_metadata(message: &str) -> (Option<String>, Option<String>, String) {
    let mut cleaned = message.to_string();
    let phase = take_marker(&mut cleaned, "[PHASE:");
    let step = take_marker(&mut cleaned, "[STEP:");
    (phase, step, cleaned)
}

fn take_marker(message: &mut String, marker: &str) -> Option<String> {
    let start = message.find(marker)?;
    let end = message[start..].find(']')?;
    let value = message[start + marker.len()..start + end].trim().to_string();
    *message = format!("{} {}", &message[..start], &message[start + end + 1..])
        .trim()
        .to_string();
    Some(value)
}

fn correlation_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"correlation_id=([A-Za-z0-9_\-]+)").ok())
        .as_ref()
}

/// Correlation id embedded as `correlation_id=<id>` in a log message.
pub fn extract_correlation_id(message: &str) -> Option<String> {
    correlation_regex()?
        .captures(message)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Format log entry as JSON for structured logging
pub fn format_json_log(
    timestamp: &str,
    level: Level,
    target: &str,
    message: &str,
    phase: Option<&str>,
    step: Option<&str>,
) -> String {
    let mut log_entry = json!({
        "timestamp": timestamp,
        "level": level.as_str(),
        "target": target,
        "message": message,
    });

    if let Some(phase) = phase {
        log_entry["phase"] = json!(phase);
    }
    if let Some(step) = step {
        log_entry["step"] = json!(step);
    }
    if let Some(correlation_id) = extract_correlation_id(message) {
        log_entry["correlationId"] = json!(correlation_id);
    }

    serde_json::to_string(&log_entry).unwrap_or_else(|_| "{}".to_string())
}

/// Format log entry as human-readable text
pub fn format_human_readable_log(
    timestamp: &str,
    level: Level,
    target: &str,
    message: &str,
    phase: Option<&str>,
    step: Option<&str>,
) -> String {
    let mut log_line = format!("[{}] [{}]", timestamp, level.as_str());

    if let Some(phase) = phase {
        log_line.push_str(&format!(" [PHASE: {}]", phase));
    }
    if let Some(step) = step {
        log_line.push_str(&format!(" [STEP: {}]", step));
    }

    log_line.push_str(&format!(" [{}] {}", target, message));
    log_line
}
