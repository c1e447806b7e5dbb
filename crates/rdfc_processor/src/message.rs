//! Payloads of the runner protocol.
//!
//! Orchestrator → worker calls: `ping`, `prepare`, `execute`.
//! Both directions: `channel` notifications carrying [`ChannelFrame`]s, data
//! frames are paced by the credits in [`crate::window`].
//! Orchestrator → worker notification: `shutdown`.
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::ir::IRStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
pub enum Method {
    Ping,
    Prepare,
    Execute,
    Channel,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareParams {
    pub stage: IRStage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub stages: Vec<StageResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    /// `None` when the stage completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One unit of traffic on a channel, multiplexed over the connection by URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub uri: String,
    #[serde(flatten)]
    pub kind: FrameKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FrameKind {
    /// Base64 encoded payload.
    Data { data: String },
    /// The sending side is done with this channel.
    Close,
    /// The receiving side consumed `amount` data frames of this channel.
    Credit { amount: u32 },
}

impl ChannelFrame {
    pub fn data(uri: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            uri: uri.into(),
            kind: FrameKind::Data {
                data: STANDARD.encode(payload),
            },
        }
    }

    pub fn close(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            kind: FrameKind::Close,
        }
    }

    pub fn credit(uri: impl Into<String>, amount: u32) -> Self {
        Self {
            uri: uri.into(),
            kind: FrameKind::Credit { amount },
        }
    }

    /// Decoded payload for data frames, `None` for every other kind.
    pub fn payload(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        match &self.kind {
            FrameKind::Data { data } => Some(STANDARD.decode(data)),
            FrameKind::Close | FrameKind::Credit { .. } => None,
        }
    }
}
