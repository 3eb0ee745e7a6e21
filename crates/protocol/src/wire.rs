//! Frames exchanged with the engine bridge.
//!
//! Both directions use the same envelope, `{"event": ..., "data": ...}`.
//! Outgoing `cmd` envelopes carry one GTP command as a string; incoming
//! `json` envelopes carry an [`EngineFrame`].

use serde::{Deserialize, Serialize};

pub const EVENT_CMD: &str = "cmd";
pub const EVENT_JSON: &str = "json";

pub const SUCCESS_SIGIL: char = '=';
pub const FAILURE_SIGIL: char = '?';

/// Marker echoed back by the engine once it has drained all prior work.
pub const NEW_TOKEN_MARKER: &str = "__NEW_TOKEN__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn command(text: impl Into<String>) -> Self {
        Self {
            event: EVENT_CMD.to_string(),
            data: serde_json::Value::String(text.into()),
        }
    }

    pub fn engine(frame: &EngineFrame) -> Self {
        Self {
            event: EVENT_JSON.to_string(),
            data: serde_json::to_value(frame).unwrap_or_default(),
        }
    }

    /// The command text of a `cmd` envelope.
    pub fn command_text(&self) -> Option<&str> {
        if self.event != EVENT_CMD {
            return None;
        }
        self.data.as_str()
    }

    /// Decodes a `json` envelope; `None` for any other event.
    pub fn engine_frame(&self) -> Option<Result<EngineFrame, serde_json::Error>> {
        if self.event != EVENT_JSON {
            return None;
        }
        Some(serde_json::from_value(self.data.clone()))
    }
}

/// One chunk of engine output, stamped by the bridge with the session token
/// that was current when the chunk was produced.
///
/// An empty `stdout` is the flush signal that terminates a buffered response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineFrame {
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl EngineFrame {
    pub fn stdout(token: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            stdout: Some(text.into()),
            stderr: None,
        }
    }

    pub fn flush(token: impl Into<String>) -> Self {
        Self::stdout(token, "")
    }

    pub fn stderr(token: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            stdout: None,
            stderr: Some(text.into()),
        }
    }
}

/// Terminal response line of a GTP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success(String),
    Failure(String),
}

impl Reply {
    /// Classifies a response line by its first character. A GTP command id
    /// directly after the sigil (`=12 body`) is dropped.
    pub fn classify(line: &str) -> Option<Self> {
        let mut chars = line.chars();
        let sigil = chars.next()?;
        let rest = chars.as_str().trim_start_matches(|c: char| c.is_ascii_digit());
        let body = rest.trim().to_string();
        match sigil {
            SUCCESS_SIGIL => Some(Self::Success(body)),
            FAILURE_SIGIL => Some(Self::Failure(body)),
            _ => None,
        }
    }
}

/// The command verb: text up to the first space.
pub fn verb(command: &str) -> &str {
    let command = command.trim_start();
    command.split(' ').next().unwrap_or(command)
}

pub fn new_token_command(token: &str) -> String {
    format!("echo {NEW_TOKEN_MARKER} {token}")
}

/// Splits `tag:payload`. Tags are non-empty runs of `[A-Za-z0-9_.-]`.
pub fn split_tagged(line: &str) -> Option<(&str, &str)> {
    let (tag, rest) = line.split_once(':')?;
    let valid = !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    valid.then_some((tag, rest))
}
