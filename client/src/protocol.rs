use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Frames exchanged with the relay server (must match server protocol)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    // Client -> Server
    CreateRoom {
        media_url: String,
    },
    JoinRoom {
        room_id: String,
    },
    LeaveRoom,
    HandOff {
        new_leader_id: Uuid,
    },
    SelectMedia {
        media_url: String,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        payload: serde_json::Value,
    },

    // Server -> Client
    RoomCreated {
        room_id: String,
        client_id: Uuid,
        media_url: String,
    },
    RoomJoined {
        room_id: String,
        client_id: Uuid,
        is_leader: bool,
        media_url: String,
    },
    RoomLeft,
    RoomNotFound,
    MediaChanged {
        room_id: String,
        media_url: String,
    },
    RoomMemberUpdate {
        room_id: String,
        members: usize,
    },
    Delivery {
        topic: String,
        from: String,
        payload: serde_json::Value,
    },
    Error {
        message: String,
    },
}

/// Logical pub/sub topics of one room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Control(String),
    SyncRequest(String),
    SyncResponse { room_id: String, client_id: String },
    Leadership(String),
}

impl Topic {
    pub fn control(room_id: &str) -> Self {
        Self::Control(room_id.to_string())
    }

    pub fn sync_request(room_id: &str) -> Self {
        Self::SyncRequest(room_id.to_string())
    }

    pub fn sync_response(room_id: &str, client_id: &str) -> Self {
        Self::SyncResponse {
            room_id: room_id.to_string(),
            client_id: client_id.to_string(),
        }
    }

    pub fn leadership(room_id: &str) -> Self {
        Self::Leadership(room_id.to_string())
    }

    pub fn room_id(&self) -> &str {
        match self {
            Self::Control(room)
            | Self::SyncRequest(room)
            | Self::Leadership(room)
            | Self::SyncResponse { room_id: room, .. } => room,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split('/');
        let kind = parts.next()?;
        let room = parts.next().filter(|r| !r.is_empty())?.to_string();
        let topic = match kind {
            "control" => Self::Control(room),
            "sync-request" => Self::SyncRequest(room),
            "leadership" => Self::Leadership(room),
            "sync-response" => {
                let client_id = parts.next().filter(|c| !c.is_empty())?.to_string();
                Self::SyncResponse {
                    room_id: room,
                    client_id,
                }
            }
            _ => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(topic)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control(room) => write!(f, "control/{room}"),
            Self::SyncRequest(room) => write!(f, "sync-request/{room}"),
            Self::SyncResponse { room_id, client_id } => {
                write!(f, "sync-response/{room_id}/{client_id}")
            }
            Self::Leadership(room) => write!(f, "leadership/{room}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Play,
    Pause,
    Sync,
}

/// Authoritative transport intent published by the leader on `control/{room}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: Action,
    pub time: f64,
}

impl ControlMessage {
    pub fn play(time: f64) -> Self {
        Self {
            action: Action::Play,
            time,
        }
    }

    pub fn pause(time: f64) -> Self {
        Self {
            action: Action::Pause,
            time,
        }
    }

    pub fn sync(time: f64) -> Self {
        Self {
            action: Action::Sync,
            time,
        }
    }

    pub fn decode(payload: &serde_json::Value) -> Result<Self> {
        let msg: Self = decode_payload("control", payload)?;
        ensure_position("control", msg.time)?;
        Ok(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub request_time: u64,
}

impl SyncRequest {
    pub fn decode(payload: &serde_json::Value) -> Result<Self> {
        decode_payload("sync-request", payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub current_time: f64,
    pub is_playing: bool,
}

impl SyncResponse {
    pub fn decode(payload: &serde_json::Value) -> Result<Self> {
        let msg: Self = decode_payload("sync-response", payload)?;
        ensure_position("sync-response", msg.current_time)?;
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadershipChange {
    pub new_leader_id: String,
}

impl LeadershipChange {
    pub fn decode(payload: &serde_json::Value) -> Result<Self> {
        decode_payload("leadership", payload)
    }
}

fn decode_payload<T: DeserializeOwned>(
    kind: &'static str,
    payload: &serde_json::Value,
) -> Result<T> {
    T::deserialize(payload).map_err(|e| Error::malformed(kind, e))
}

fn ensure_position(kind: &'static str, time: f64) -> Result<()> {
    if time.is_finite() && time >= 0.0 {
        Ok(())
    } else {
        Err(Error::malformed(kind, format!("invalid playback position {time}")))
    }
}
