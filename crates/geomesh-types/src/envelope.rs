//! Wire envelopes for the event bus, push stream and session transport.
//!
//! Field names are part of the client contract and must not change.

use crate::{JsonMap, Location, Presence};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A message delivered to event bus subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubSubMessage {
    pub topic: String,
    pub payload: JsonMap,
}

/// Payload broadcast on the location updates topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdatePayload {
    pub user_id: String,
    pub location: Location,
    pub presence: Presence,
}

/// Typed message delivered to a user's push channel or session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub data: JsonMap,
    /// Unix seconds.
    pub timestamp: i64,
}

impl Envelope {
    /// Builds an envelope stamped with the current time.
    pub fn new(kind: impl Into<String>, data: JsonMap, request_id: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            request_id: request_id.filter(|id| !id.is_empty()),
            data,
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// HTTP-style verb carried by an inbound RPC request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RpcMethod {
    Get,
    Post,
    Patch,
    Delete,
}

impl RpcMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RpcMethod {
    type Err = ParseRpcMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(ParseRpcMethodError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown RPC method.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown rpc method: {0}")]
pub struct ParseRpcMethodError(pub String);

/// Inbound request received over a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub request_id: String,
    pub method: RpcMethod,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<HashMap<String, String>>,
}

/// Response correlated to an [`RpcRequest`] by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub request_id: String,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix seconds.
    pub timestamp: i64,
}

impl RpcResponse {
    pub fn success(request_id: impl Into<String>, status_code: u16, data: JsonMap) -> Self {
        Self {
            request_id: request_id.into(),
            status_code,
            data: Some(data),
            error: None,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn failure(
        request_id: impl Into<String>,
        status_code: u16,
        error: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status_code,
            data: None,
            error: Some(error.into()),
            timestamp: Utc::now().timestamp(),
        }
    }
}
