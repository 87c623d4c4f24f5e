//! Stats stream message types and SSE frame decoding
//!
//! Wire format: one SSE frame per message, the frame's `event:` name selects
//! the message kind and a single JSON `data:` payload carries its fields.
//!
//! ```text
//! event: identity
//! data: {"identifier":"Magnus","displayName":"Magnus C.","avatarUrl":"..."}
//!
//! event: start
//! data: {"totalUnits":12,"fromCache":false}
//!
//! event: progress
//! data: {"currentUnit":3,"label":"2024-03"}
//!
//! event: complete
//! data: {"payload":{...}}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Identity confirmation sent before any statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityMessage {
    pub identifier: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    total_units: u32,
    #[serde(default)]
    from_cache: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressBody {
    current_unit: u32,
    #[serde(default)]
    label: String,
}

#[derive(Debug, Deserialize)]
struct CompleteBody {
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(alias = "message")]
    reason: String,
}

/// One message of a stats stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Identity(IdentityMessage),
    Start { total_units: u32, from_cache: bool },
    Progress { current_unit: u32, label: String },
    Complete { payload: serde_json::Value },
    Error { reason: String },
}

impl StreamMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Identity(_) => "identity",
            StreamMessage::Start { .. } => "start",
            StreamMessage::Progress { .. } => "progress",
            StreamMessage::Complete { .. } => "complete",
            StreamMessage::Error { .. } => "error",
        }
    }

    /// Decode a frame by event name
    ///
    /// Returns `Ok(None)` for event names this engine does not consume.
    pub fn decode(event: &str, data: &str) -> SyncResult<Option<StreamMessage>> {
        let malformed =
            |e: serde_json::Error| SyncError::ProtocolViolation(format!("malformed {} frame: {}", event, e));

        let message = match event {
            "identity" => StreamMessage::Identity(serde_json::from_str(data).map_err(malformed)?),
            "start" => {
                let body: StartBody = serde_json::from_str(data).map_err(malformed)?;
                StreamMessage::Start {
                    total_units: body.total_units,
                    from_cache: body.from_cache,
                }
            }
            "progress" => {
                let body: ProgressBody = serde_json::from_str(data).map_err(malformed)?;
                StreamMessage::Progress {
                    current_unit: body.current_unit,
                    label: body.label,
                }
            }
            "complete" => {
                let body: CompleteBody = serde_json::from_str(data).map_err(malformed)?;
                StreamMessage::Complete {
                    payload: body.payload,
                }
            }
            "error" => {
                let body: ErrorBody = serde_json::from_str(data).map_err(malformed)?;
                StreamMessage::Error {
                    reason: body.reason,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

/// Incremental SSE decoder
///
/// Accepts arbitrary byte chunks (frames and lines may be split across
/// chunks) and yields decoded messages as each frame's terminating blank line
/// arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line_buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every message completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SyncResult<StreamMessage>> {
        let mut out = Vec::new();
        self.line_buffer.extend_from_slice(chunk);
        while let Some(newline_index) = self.line_buffer.iter().position(|byte| *byte == b'\n') {
            let mut line = self.line_buffer.drain(..=newline_index).collect::<Vec<_>>();
            line.pop();
            if matches!(line.last(), Some(b'\r')) {
                line.pop();
            }
            if let Some(result) = self.process_line(&line) {
                out.push(result);
            }
        }
        out
    }

    /// Flush a trailing frame when the transport ends without a blank line
    pub fn finish(&mut self) -> Option<SyncResult<StreamMessage>> {
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            if let Some(result) = self.process_line(&line) {
                return Some(result);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &[u8]) -> Option<SyncResult<StreamMessage>> {
        let line = match std::str::from_utf8(line) {
            Ok(line) => line,
            Err(e) => {
                return Some(Err(SyncError::ProtocolViolation(format!(
                    "non UTF-8 stream line: {}",
                    e
                ))))
            }
        };

        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // comment / keep-alive
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SyncResult<StreamMessage>> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        let event = event.unwrap_or_else(|| "message".to_string());

        match StreamMessage::decode(&event, &data) {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => {
                tracing::debug!(event = %event, "Ignoring unknown stream event");
                None
            }
            Err(e) => Some(Err(e)),
        }
    }
}
