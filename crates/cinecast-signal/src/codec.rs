//! Wire codec for session-description payloads.
//!
//! Two shapes are accepted on decode:
//! - Flat: `base64(json({type, sdp}))`
//! - Enveloped: `base64(json({action, name, sdp: base64(json({type, sdp}))}))`
//!
//! Encode emits the enveloped form whenever a stream name is present and the
//! flat form otherwise. Relays route on `action`/`name` without reading the
//! inner description.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DecodeError, EncodeError};
use crate::types::{Role, SessionDescription};

/// Envelope `action` field; mirrors [`Role`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Broadcast,
    Join,
}

impl From<Role> for Action {
    fn from(role: Role) -> Self {
        match role {
            Role::Publisher => Self::Broadcast,
            Role::Subscriber => Self::Join,
        }
    }
}

impl From<Action> for Role {
    fn from(action: Action) -> Self {
        match action {
            Action::Broadcast => Self::Publisher,
            Action::Join => Self::Subscriber,
        }
    }
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Join => "join",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "broadcast" => Ok(Self::Broadcast),
            "join" => Ok(Self::Join),
            other => Err(DecodeError::Malformed(format!("unknown action {other:?}"))),
        }
    }
}

/// Outer routing envelope. `sdp` is the base64 inner description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: Action,
    pub name: String,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFormat {
    Flat,
    Enveloped {
        action: Option<Action>,
        name: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPayload {
    pub description: SessionDescription,
    pub format: WireFormat,
}

/// Serializes a local description for the relay.
pub fn encode_offer(
    description: &SessionDescription,
    stream_name: &str,
    role: Role,
) -> Result<String, EncodeError> {
    let inner = encode_json(description)?;
    if stream_name.is_empty() {
        return Ok(inner);
    }

    let envelope = Envelope {
        action: role.into(),
        name: stream_name.to_string(),
        sdp: inner,
    };
    encode_json(&envelope)
}

/// Decodes a counterpart description in either wire shape.
pub fn decode_remote(wire: &str) -> Result<SessionDescription, DecodeError> {
    decode_payload(wire).map(|payload| payload.description)
}

/// Like [`decode_remote`], also reporting which wire shape was recognized.
pub fn decode_payload(wire: &str) -> Result<DecodedPayload, DecodeError> {
    let parsed = decode_json(wire)?;
    let Some(fields) = parsed.as_object() else {
        return Err(DecodeError::Unrecognized);
    };

    if is_present(fields.get("type")) && is_present(fields.get("sdp")) {
        let description = description_from(parsed)?;
        return Ok(DecodedPayload {
            description,
            format: WireFormat::Flat,
        });
    }

    if is_present(fields.get("sdp")) {
        let inner = fields
            .get("sdp")
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::Malformed("envelope sdp is not a string".into()))?;
        let description = description_from(decode_json(inner)?)?;
        let action = fields
            .get("action")
            .and_then(Value::as_str)
            .and_then(|a| a.parse().ok());
        let name = fields
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Ok(DecodedPayload {
            description,
            format: WireFormat::Enveloped { action, name },
        });
    }

    Err(DecodeError::Unrecognized)
}

/// Decodes only the outer routing envelope, leaving `sdp` encoded.
pub fn decode_envelope(wire: &str) -> Result<Envelope, DecodeError> {
    let parsed = decode_json(wire)?;
    serde_json::from_value(parsed).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn encode_json<T: Serialize>(value: &T) -> Result<String, EncodeError> {
    let json = serde_json::to_string(value)?;
    Ok(general_purpose::STANDARD.encode(json))
}

fn decode_json(b64: &str) -> Result<Value, DecodeError> {
    let bytes = general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|e| DecodeError::Malformed(format!("invalid base64: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| DecodeError::Malformed(format!("invalid JSON: {e}")))
}

fn description_from(value: Value) -> Result<SessionDescription, DecodeError> {
    serde_json::from_value(value)
        .map_err(|e| DecodeError::Malformed(format!("invalid session description: {e}")))
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}
