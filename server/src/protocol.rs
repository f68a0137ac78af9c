use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt};
use uuid::Uuid;

/// Messages sent between client and server
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

/// Publisher identity stamped on messages the server originates.
pub const SERVER_ORIGIN: &str = "server";

/// Payload announced on `leadership/{room}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadershipChange {
    pub new_leader_id: String,
}

/// Pub/sub topics the relay routes. Each one belongs to exactly one room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Control(String),
    SyncRequest(String),
    SyncResponse { room_id: String, client_id: String },
    Leadership(String),
}

impl Topic {
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
            "sync-response" => Self::SyncResponse {
                room_id: room,
                client_id: parts.next().filter(|c| !c.is_empty())?.to_string(),
            },
            _ => return None,
        };
        parts.next().is_none().then_some(topic)
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

/// Room state tracked by server
#[derive(Debug, Clone)]
pub struct Room {
    pub leader_id: Uuid,
    pub media_url: String,
}

/// Client connection metadata
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub room_id: Option<String>,
    /// Topics this client currently receives deliveries for.
    pub topics: HashSet<Topic>,
}
