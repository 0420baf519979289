// Helpers over the JSON entry arrays stored in conversation and transcript
// files.
//
// Conversation entries look like `{"role": "user", "content": ...}` where
// content is a string or a list of `{"type": "text", "text": ...}` blocks.
// Transcript entries look like `{"ts": 1, "type": "say", "say": "text",
// "text": ...}`; the `say` field names the entry kind.

use serde_json::Value;

/// Transcript entry kind written by local checkpoint tooling. Never replayed
/// into a restored session.
pub const CHECKPOINT_SAVED_KIND: &str = "checkpoint_saved";

/// First non-empty user-authored text, whitespace collapsed to single spaces.
pub fn first_utterance(content: &[u8]) -> Option<String> {
    let entries: Vec<Value> = serde_json::from_slice(content).ok()?;
    entries
        .iter()
        .filter_map(entry_text)
        .map(|text| normalize_whitespace(&text))
        .find(|text| !text.is_empty())
}

/// Drop checkpoint entries. Returns the re-encoded entries and how many were removed.
/// Content that is not a JSON array is returned unchanged.
pub fn strip_checkpoint_entries(content: &[u8]) -> (Vec<u8>, usize) {
    let Ok(entries) = serde_json::from_slice::<Vec<Value>>(content) else {
        return (content.to_vec(), 0);
    };
    let before = entries.len();
    let kept: Vec<Value> = entries.into_iter().filter(|entry| !is_checkpoint(entry)).collect();
    let removed = before - kept.len();
    if removed == 0 {
        return (content.to_vec(), 0);
    }
    match serde_json::to_vec(&kept) {
        Ok(encoded) => (encoded, removed),
        Err(_) => (content.to_vec(), 0),
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_checkpoint(entry: &Value) -> bool {
    entry.get("say").and_then(Value::as_str) == Some(CHECKPOINT_SAVED_KIND)
}

fn entry_text(entry: &Value) -> Option<String> {
    if let Some(role) = entry.get("role").and_then(Value::as_str) {
        if role != "user" {
            return None;
        }
        return match entry.get("content")? {
            Value::String(text) => Some(text.clone()),
            Value::Array(blocks) => {
                let text = blocks
                    .iter()
                    .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|block| block.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join(" ");
                Some(text)
            }
            _ => None,
        };
    }

    match entry.get("say").and_then(Value::as_str) {
        Some("text") | Some("task") => entry.get("text").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}
