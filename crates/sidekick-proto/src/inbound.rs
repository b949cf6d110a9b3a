//! Inbound socket messages and parsing.

use crate::error::{ProtoError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message received from the realtime backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "CLASSIFICATION_RESULT", rename_all = "camelCase")]
    ClassificationResult {
        transcript_id: String,
        ai_answer: String,
        classification: String,
        confidence: f64,
        #[serde(default)]
        suggestions: Vec<String>,
    },

    #[serde(rename = "QUESTION", rename_all = "camelCase")]
    Question {
        transcript_id: String,
        original_question: String,
        ai_answer: String,
        #[serde(default, rename = "speakerFLName", skip_serializing_if = "Option::is_none")]
        speaker_fl_name: Option<String>,
    },

    #[serde(rename = "ERROR")]
    Error { error: String },
}

const KNOWN_KINDS: [&str; 3] = ["CLASSIFICATION_RESULT", "QUESTION", "ERROR"];

/// Parse inbound JSON text into a typed message.
///
/// Returns `Ok(None)` for well-formed messages of an unrecognized kind so the
/// dispatcher can log and drop them without treating them as failures.
pub fn parse_inbound(text: &str) -> Result<Option<InboundMessage>> {
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(ProtoError::Malformed(
            "expected JSON object message".to_string(),
        ));
    }

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err(ProtoError::Malformed("missing message type".to_string()));
    };
    if !KNOWN_KINDS.contains(&kind) {
        return Ok(None);
    }

    let kind = kind.to_string();
    serde_json::from_value(value)
        .map(Some)
        .map_err(|error| ProtoError::Malformed(format!("invalid {kind} payload: {error}")))
}
