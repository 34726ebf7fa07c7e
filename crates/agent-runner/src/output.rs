//! Structured agent output parsing.
//!
//! The sandbox streams a sequence of JSON documents on stdout; the final
//! document with `type == "result"` is authoritative. Older agent versions
//! emit a single JSON object, so parsing falls back to the last JSON object
//! found on the stream.

use serde::{Deserialize, Deserializer};

/// Token counts reported for a single turn.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AgentUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

/// The final result document of one agent turn.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentOutput {
    #[serde(default, deserialize_with = "null_as_default")]
    pub result: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub session_id: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub usage: AgentUsage,
}

impl AgentOutput {
    /// Stop reason with `null` normalized to the empty string.
    pub fn stop_reason(&self) -> &str {
        self.stop_reason.as_deref().unwrap_or("")
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parse the raw stdout of an agent container into its result document.
pub fn parse_agent_output(raw: &str) -> Result<AgentOutput, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty output".to_string());
    }

    // Collect every JSON document on the stream; a trailing parse error only
    // discards the malformed tail, not the documents before it.
    let mut documents: Vec<serde_json::Value> = Vec::new();
    for document in serde_json::Deserializer::from_str(raw).into_iter::<serde_json::Value>() {
        match document {
            Ok(value) => documents.push(value),
            Err(_) => break,
        }
    }

    // The final `result` document wins.
    if let Some(result_doc) = documents
        .iter()
        .rev()
        .find(|v| v.get("type").and_then(|t| t.as_str()) == Some("result"))
    {
        return serde_json::from_value(result_doc.clone()).map_err(|e| e.to_string());
    }

    // Fallback: the last JSON object on stdout.
    if let Some(last_object) = documents.iter().rev().find(|v| v.is_object()) {
        return serde_json::from_value(last_object.clone()).map_err(|e| e.to_string());
    }

    Err(format!("no JSON object found in output ({} bytes)", raw.len()))
}

/// Truncate a string for log lines and event payloads.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &s[..cut])
}
