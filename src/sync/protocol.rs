// Wire messages shared by the sync server and client: the JSON bodies of the
// fetch/replace endpoints and the frames sent over the push channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server → client push channel frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    /// A domain's state was committed; carries the full new payload
    StateUpdate {
        domain: String,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// First frame on every new channel
    ConnectionEstablished {
        timestamp: DateTime<Utc>,
        message: String,
    },

    /// Reply to a client `ping`
    Pong { timestamp: DateTime<Utc> },
}

impl PushEvent {
    pub fn state_update(domain: impl Into<String>, data: Value) -> Self {
        Self::StateUpdate {
            domain: domain.into(),
            data,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn connection_established() -> Self {
        Self::ConnectionEstablished {
            timestamp: Utc::now(),
            message: "State sync channel active".to_string(),
        }
    }
}

/// Optional client → server frames; the sync client itself never sends these
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    /// Ask for one `state_update` per committed domain
    RequestSync,
}

/// Body of `GET /api/{domain}/state`
///
/// `success: true` with `state: None` means nothing was saved yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub success: bool,
    pub state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of `POST /api/{domain}/state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaceResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}
