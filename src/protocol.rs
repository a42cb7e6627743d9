//! Wire contract between participant and host.
//!
//! Five calls, always participant-initiated. Frames are self-describing JSON
//! so the per-task payloads can stay opaque to the engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const PROTOCOL_VERSION: u8 = 1;

/// Queued input events per task, drained from the participant on each
/// outbound exchange.
pub type InputMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum Request {
    ConfirmConnected { session_id: Uuid },
    GetScenarioPath,
    GetTime,
    GetSyncData,
    PassNewInput { inputs: InputMap },
}

impl Request {
    pub fn call_name(&self) -> &'static str {
        match self {
            Request::ConfirmConnected { .. } => "confirm_connected",
            Request::GetScenarioPath => "get_scenario_path",
            Request::GetTime => "get_time",
            Request::GetSyncData => "get_sync_data",
            Request::PassNewInput { .. } => "pass_new_input",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Response {
    Ack { ok: bool },
    ScenarioPath { path: String },
    Time { elapsed_ms: i64 },
    SyncData(SyncFrame),
}

/// Host-authoritative task snapshots plus the termination flag.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncFrame {
    #[serde(default)]
    pub payloads: BTreeMap<String, Value>,
    #[serde(default)]
    pub terminate: bool,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>, FrameError> {
    serde_json::to_vec(request).map_err(FrameError::Encode)
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, FrameError> {
    serde_json::from_slice(bytes).map_err(FrameError::Decode)
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>, FrameError> {
    serde_json::to_vec(response).map_err(FrameError::Encode)
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, FrameError> {
    serde_json::from_slice(bytes).map_err(FrameError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_use_their_literal_wire_names() {
        let encoded = encode_request(&Request::GetSyncData).unwrap();
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.contains("\"get_sync_data\""));

        let encoded = encode_request(&Request::PassNewInput {
            inputs: InputMap::new(),
        })
        .unwrap();
        assert!(String::from_utf8(encoded).unwrap().contains("\"pass_new_input\""));
    }

    #[test]
    fn sync_frames_default_to_no_termination() {
        let decoded: SyncFrame = serde_json::from_str("{\"payloads\":{}}").unwrap();
        assert!(!decoded.terminate);
        assert!(decoded.payloads.is_empty());
    }
}
