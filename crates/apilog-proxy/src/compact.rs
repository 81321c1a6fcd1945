//! Compaction of streamed (Server-Sent Events) message responses
//!
//! A streamed message arrives as many `data:` events. For storage they can be
//! folded into one JSON document carrying the message metadata, the
//! concatenated text, and the final usage counters.

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};

/// Fold an SSE body into a single JSON document.
///
/// Returns `None` when the body is not an event stream or contains no
/// parseable data events, in which case the caller stores it unchanged.
pub fn compact_streaming_response(raw: &str) -> Option<String> {
    if !raw.trim_start().starts_with("event:") {
        return None;
    }

    let mut chunks = 0usize;
    let mut metadata = Map::new();
    let mut usage = Map::new();
    let mut text = String::new();

    for line in raw.lines() {
        let Some(data) = line.trim().strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        chunks += 1;

        match event.get("type").and_then(Value::as_str) {
            Some("message_start") if metadata.is_empty() => {
                let message = event.get("message").cloned().unwrap_or(Value::Null);
                for key in ["id", "role", "model", "stop_reason", "stop_sequence"] {
                    metadata.insert(
                        key.to_string(),
                        message.get(key).cloned().unwrap_or(Value::Null),
                    );
                }
                metadata.insert("type".to_string(), json!("message"));
                if let Some(Value::Object(initial)) = message.get("usage") {
                    usage = initial.clone();
                }
            }
            Some("content_block_delta") => {
                let delta = event.get("delta");
                let piece = match delta.and_then(|d| d.get("type")).and_then(Value::as_str) {
                    Some("text_delta") => delta.and_then(|d| d.get("text")),
                    Some("thinking_delta") => delta.and_then(|d| d.get("thinking")),
                    _ => None,
                };
                if let Some(piece) = piece.and_then(Value::as_str) {
                    text.push_str(piece);
                }
            }
            Some("message_delta") => {
                if let Some(reason) = event
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .filter(|r| !r.is_null())
                {
                    metadata.insert("stop_reason".to_string(), reason.clone());
                }
                if let Some(Value::Object(delta_usage)) = event.get("usage") {
                    for (key, value) in delta_usage {
                        usage.insert(key.clone(), value.clone());
                    }
                }
            }
            _ => {}
        }
    }

    if chunks == 0 {
        return None;
    }

    let mut compacted = metadata;
    compacted.insert(
        "content".to_string(),
        json!([{ "type": "text", "text": text }]),
    );
    compacted.insert("usage".to_string(), Value::Object(usage));
    compacted.insert(
        "_compacted".to_string(),
        json!({
            "original_chunks": chunks,
            "compacted_at": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        }),
    );

    serde_json::to_string(&Value::Object(compacted)).ok()
}
