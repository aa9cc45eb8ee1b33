//! Wire message codec
//!
//! One JSON object per line:
//! `{"sender": "...", "receiver": "...", "cmd": "...", "payload": {...}}`.
//! `payload` defaults to an empty map and `cmd` is normalised to uppercase.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Line is not a valid message object
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A required field is empty
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// Blank line
    #[error("Empty frame")]
    Empty,
}

/// Message exchanged between trucks, devices and the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Originating peer id
    pub sender: String,
    /// Destination peer id
    #[serde(default)]
    pub receiver: String,
    /// Uppercase command token
    pub cmd: String,
    /// Command arguments
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Message {
    /// Build a message with an empty payload
    pub fn new(sender: impl Into<String>, receiver: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            cmd: cmd.into(),
            payload: Map::new(),
        }
    }

    /// Add a payload entry
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// String payload field
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Integer payload field; numeric strings are accepted
    pub fn payload_i64(&self, key: &str) -> Option<i64> {
        match self.payload.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean payload field
    pub fn payload_bool(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }

    /// Serialize as one newline-terminated line
    pub fn encode(&self) -> Result<String, CodecError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line
    pub fn decode(line: &str) -> Result<Self, CodecError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CodecError::Empty);
        }

        let mut message: Message = serde_json::from_str(line)?;
        message.sender = message.sender.trim().to_string();
        message.cmd = message.cmd.trim().to_ascii_uppercase();

        if message.sender.is_empty() {
            return Err(CodecError::MissingField("sender"));
        }
        if message.cmd.is_empty() {
            return Err(CodecError::MissingField("cmd"));
        }
        Ok(message)
    }
}
