//! Router request logging.
//!
//! Every proxied request produces one [`RequestLogEntry`]: a human line on
//! stdout (via tracing) always, plus one JSON line appended to
//! `logs/router.log` when the router is configured verbose. The file is
//! rotated once it exceeds 100 MB — renamed to a timestamped archive, a
//! fresh file started.

use std::{
    io::Write as _,
    path::PathBuf,
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Rotation threshold for the JSON log file.
const ROTATE_THRESHOLD: u64 = 100 * 1024 * 1024;
/// How much of the last user message survives into the log.
const PROMPT_PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLogEntry {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub endpoint: String,
    pub method: String,
    /// `"success"` or `"error"`.
    pub status: &'static str,
    pub status_code: u16,
    pub duration_ms: u64,
    /// `host:port` of the backend that served the request, when one was
    /// selected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// First 50 characters of the last user message, newlines flattened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestLogEntry {
    pub fn new(model: &str, endpoint: &str, method: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            model: model.to_string(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            status: "success",
            status_code: 200,
            duration_ms: 0,
            backend: None,
            prompt: None,
            error: None,
        }
    }

    pub fn with_backend(mut self, tag: &str) -> Self {
        self.backend = Some(tag.to_string());
        self
    }

    pub fn with_prompt(mut self, body: &Value) -> Self {
        self.prompt = prompt_preview(body);
        self
    }

    pub fn with_duration(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    pub fn succeeded(mut self, status_code: u16) -> Self {
        self.status = "success";
        self.status_code = status_code;
        self
    }

    pub fn failed(mut self, status_code: u16, error: &str) -> Self {
        self.status = "error";
        self.status_code = status_code;
        self.error = Some(error.to_string());
        self
    }
}

/// Preview of the last user message: first 50 chars, newlines → spaces.
pub fn prompt_preview(body: &Value) -> Option<String> {
    let messages = body["messages"].as_array()?;
    let last_user = messages.iter().rev().find(|m| m["role"] == "user")?;

    let text = match &last_user["content"] {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join(" "),
        _ => return None,
    };

    let flattened: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .take(PROMPT_PREVIEW_CHARS)
        .collect();
    (!flattened.is_empty()).then_some(flattened)
}

/// Sink for request log entries.
pub struct RequestLog {
    path: PathBuf,
    verbose: bool,
    // Serializes append + rotation; contention is per-request logging only.
    file_lock: Mutex<()>,
}

impl RequestLog {
    pub fn new(path: PathBuf, verbose: bool) -> Self {
        Self { path, verbose, file_lock: Mutex::new(()) }
    }

    pub fn record(&self, entry: RequestLogEntry) {
        tracing::info!(
            model = %entry.model,
            endpoint = %entry.endpoint,
            status = entry.status_code,
            duration_ms = entry.duration_ms,
            backend = entry.backend.as_deref().unwrap_or("-"),
            "request"
        );

        if !self.verbose {
            return;
        }
        let Ok(line) = serde_json::to_string(&entry) else {
            return;
        };

        let _guard = self.file_lock.lock().expect("log lock");
        self.rotate_if_needed();
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            tracing::warn!(file = %self.path.display(), error = %e, "could not append request log");
        }
    }

    fn rotate_if_needed(&self) {
        let Ok(meta) = std::fs::metadata(&self.path) else {
            return;
        };
        if meta.len() <= ROTATE_THRESHOLD {
            return;
        }
        let archived = self
            .path
            .with_extension(format!("log.{}", Utc::now().format("%Y%m%d%H%M%S")));
        if let Err(e) = std::fs::rename(&self.path, &archived) {
            tracing::warn!(error = %e, "request log rotation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -----------------------------------------------------------------------
    // Prompt previews
    // -----------------------------------------------------------------------

    #[test]
    fn preview_takes_last_user_message() {
        let body = json!({
            "messages": [
                { "role": "user", "content": "first question" },
                { "role": "assistant", "content": "answer" },
                { "role": "user", "content": "second question" },
            ],
        });
        assert_eq!(prompt_preview(&body).unwrap(), "second question");
    }

    #[test]
    fn preview_truncates_to_fifty_chars_and_flattens_newlines() {
        let long = format!("line one\nline two\n{}", "x".repeat(80));
        let body = json!({ "messages": [{ "role": "user", "content": long }] });
        let preview = prompt_preview(&body).unwrap();
        assert_eq!(preview.chars().count(), 50);
        assert!(!preview.contains('\n'));
        assert!(preview.starts_with("line one line two"));
    }

    #[test]
    fn preview_handles_block_content() {
        let body = json!({
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": "from" },
                    { "type": "text", "text": "blocks" },
                ],
            }],
        });
        assert_eq!(prompt_preview(&body).unwrap(), "from blocks");
    }

    #[test]
    fn preview_is_none_without_user_messages() {
        assert!(prompt_preview(&json!({ "messages": [] })).is_none());
        assert!(prompt_preview(&json!({})).is_none());
    }

    // -----------------------------------------------------------------------
    // File sink
    // -----------------------------------------------------------------------

    #[test]
    fn verbose_log_appends_one_json_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.log");
        let log = RequestLog::new(path.clone(), true);

        log.record(
            RequestLogEntry::new("m.gguf", "/v1/chat/completions", "POST")
                .with_backend("127.0.0.1:9000")
                .succeeded(200)
                .with_duration(12),
        );
        log.record(
            RequestLogEntry::new("m.gguf", "/v1/messages", "POST").failed(502, "connect refused"),
        );

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["model"], "m.gguf");
        assert_eq!(first["status"], "success");
        assert_eq!(first["statusCode"], 200);
        assert_eq!(first["backend"], "127.0.0.1:9000");

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["status"], "error");
        assert_eq!(second["error"], "connect refused");
    }

    #[test]
    fn non_verbose_log_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.log");
        let log = RequestLog::new(path.clone(), false);
        log.record(RequestLogEntry::new("m", "/v1/models", "GET"));
        assert!(!path.exists());
    }
}
