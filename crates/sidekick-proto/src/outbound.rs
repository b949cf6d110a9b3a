//! Outbound socket messages.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message sent from a client context to the realtime backend.
///
/// Every variant carries the id of the meeting session it belongs to. Queued
/// messages are re-stamped to the current session right before delivery, so
/// the id stored here is a snapshot, not a commitment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "SESSION_START", rename_all = "camelCase")]
    SessionStart {
        session_id: String,
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },

    #[serde(rename = "SESSION_END", rename_all = "camelCase")]
    SessionEnd { session_id: String, timestamp: i64 },

    #[serde(rename = "TRANSCRIPT_TEXT", rename_all = "camelCase")]
    TranscriptText {
        session_id: String,
        timestamp: i64,
        transcript_id: String,
        text: String,
        captured_at: i64,
    },

    #[serde(rename = "CUSTOM_MESSAGE", rename_all = "camelCase")]
    Custom {
        session_id: String,
        timestamp: i64,
        payload: Value,
    },
}

impl OutboundMessage {
    pub fn session_start(session_id: impl Into<String>, title: Option<String>, timestamp: i64) -> Self {
        Self::SessionStart {
            session_id: session_id.into(),
            timestamp,
            title,
        }
    }

    pub fn session_end(session_id: impl Into<String>, timestamp: i64) -> Self {
        Self::SessionEnd {
            session_id: session_id.into(),
            timestamp,
        }
    }

    pub fn transcript_text(
        session_id: impl Into<String>,
        transcript_id: impl Into<String>,
        text: impl Into<String>,
        captured_at: i64,
        timestamp: i64,
    ) -> Self {
        Self::TranscriptText {
            session_id: session_id.into(),
            timestamp,
            transcript_id: transcript_id.into(),
            text: text.into(),
            captured_at,
        }
    }

    pub fn custom(session_id: impl Into<String>, payload: Value, timestamp: i64) -> Self {
        Self::Custom {
            session_id: session_id.into(),
            timestamp,
            payload,
        }
    }

    /// Wire name of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "SESSION_START",
            Self::SessionEnd { .. } => "SESSION_END",
            Self::TranscriptText { .. } => "TRANSCRIPT_TEXT",
            Self::Custom { .. } => "CUSTOM_MESSAGE",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionStart { session_id, .. }
            | Self::SessionEnd { session_id, .. }
            | Self::TranscriptText { session_id, .. }
            | Self::Custom { session_id, .. } => session_id,
        }
    }

    /// Re-stamp the message onto another session.
    pub fn set_session_id(&mut self, id: impl Into<String>) {
        match self {
            Self::SessionStart { session_id, .. }
            | Self::SessionEnd { session_id, .. }
            | Self::TranscriptText { session_id, .. }
            | Self::Custom { session_id, .. } => *session_id = id.into(),
        }
    }

    /// Encode to the wire JSON text.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
