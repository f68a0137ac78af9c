use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{ClientInfo, Room, Topic};

pub const LOG_TAG: &str = "[Lockstep Server]";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("Room not found")]
    NotFound,
    #[error("Not in a room")]
    NotInRoom,
    #[error("Only the leader can {0}")]
    NotLeader(&'static str),
    #[error("Client {0} is not a member of this room")]
    NotMember(Uuid),
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
    #[error("Topic {0} does not belong to you")]
    ForeignTopic(String),
    #[error("Publishing on {0} is not allowed")]
    PublishDenied(String),
    #[error("Media URL must not be empty")]
    EmptyMedia,
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub is_leader: bool,
    pub media_url: String,
}

/// What changed in a room when a client left it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub room_id: String,
    /// Set when the departing client was the leader and someone remains.
    pub new_leader: Option<Uuid>,
    pub room_closed: bool,
}

/// Shared server state
#[derive(Clone, Default)]
pub struct ServerState {
    /// All active rooms: room_id -> Room
    pub rooms: Arc<DashMap<String, Room>>,
    /// All connected clients: client_id -> ClientInfo
    pub clients: Arc<DashMap<Uuid, ClientInfo>>,
    /// Room membership in join order: room_id -> Vec<client_id>
    pub room_members: Arc<DashMap<String, Arc<RwLock<Vec<Uuid>>>>>,
    /// Topic routing table: topic -> subscribed clients
    subscribers: Arc<DashMap<Topic, HashSet<Uuid>>>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_room(&self, leader_id: Uuid, media_url: String) -> Result<String, RoomError> {
        if media_url.trim().is_empty() {
            return Err(RoomError::EmptyMedia);
        }

        let room_id = self.generate_room_code();
        self.rooms.insert(
            room_id.clone(),
            Room {
                leader_id,
                media_url,
            },
        );
        self.room_members
            .insert(room_id.clone(), Arc::new(RwLock::new(vec![leader_id])));

        if let Some(mut client) = self.clients.get_mut(&leader_id) {
            client.room_id = Some(room_id.clone());
        }

        tracing::info!("{LOG_TAG} Room {} created by client {}", room_id, leader_id);
        Ok(room_id)
    }

    pub async fn join_room(
        &self,
        client_id: Uuid,
        room_id: &str,
    ) -> Result<JoinOutcome, RoomError> {
        let (leader_id, media_url) = self
            .rooms
            .get(room_id)
            .map(|room| (room.leader_id, room.media_url.clone()))
            .ok_or(RoomError::NotFound)?;

        let members = self.members_lock(room_id).ok_or(RoomError::NotFound)?;
        {
            let mut members = members.write().await;
            if !members.contains(&client_id) {
                members.push(client_id);
            }
        }

        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.room_id = Some(room_id.to_string());
        }

        tracing::info!("{LOG_TAG} Client {} joined room {}", client_id, room_id);
        Ok(JoinOutcome {
            is_leader: leader_id == client_id,
            media_url,
        })
    }

    /// Remove a client from its room, dropping its subscriptions.
    ///
    /// When the leader leaves, the longest-present remaining member takes
    /// over. The last member out deletes the room.
    pub async fn leave_room(&self, client_id: Uuid) -> Option<LeaveOutcome> {
        let room_id = self.clients.get(&client_id).and_then(|c| c.room_id.clone())?;
        self.drop_subscriptions(client_id);

        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.room_id = None;
        }

        let remaining = match self.members_lock(&room_id) {
            Some(members) => {
                let mut members = members.write().await;
                members.retain(|id| *id != client_id);
                members.clone()
            }
            None => Vec::new(),
        };

        if remaining.is_empty() {
            self.room_members.remove(&room_id);
            self.rooms.remove(&room_id);
            tracing::info!("{LOG_TAG} Room {} deleted (empty)", room_id);
            return Some(LeaveOutcome {
                room_id,
                new_leader: None,
                room_closed: true,
            });
        }

        let mut new_leader = None;
        if let Some(mut room) = self.rooms.get_mut(&room_id) {
            if room.leader_id == client_id {
                room.leader_id = remaining[0];
                new_leader = Some(remaining[0]);
                tracing::info!(
                    "{LOG_TAG} Leadership of room {} passed to {}",
                    room_id,
                    remaining[0]
                );
            }
        }

        tracing::info!("{LOG_TAG} Client {} left room {}", client_id, room_id);
        Some(LeaveOutcome {
            room_id,
            new_leader,
            room_closed: false,
        })
    }

    /// Explicit leadership transfer by the current leader. Returns the room id.
    pub async fn hand_off(
        &self,
        client_id: Uuid,
        new_leader_id: Uuid,
    ) -> Result<String, RoomError> {
        let room_id = self.require_leader(client_id, "hand off leadership")?;

        let members = self.get_room_members(&room_id).await;
        if !members.contains(&new_leader_id) {
            return Err(RoomError::NotMember(new_leader_id));
        }

        let mut room = self.rooms.get_mut(&room_id).ok_or(RoomError::NotFound)?;
        room.leader_id = new_leader_id;
        tracing::info!(
            "{LOG_TAG} Client {} handed room {} to {}",
            client_id,
            room_id,
            new_leader_id
        );
        Ok(room_id)
    }

    /// Replace the room's media. Returns the room id.
    pub fn select_media(&self, client_id: Uuid, media_url: String) -> Result<String, RoomError> {
        if media_url.trim().is_empty() {
            return Err(RoomError::EmptyMedia);
        }
        let room_id = self.require_leader(client_id, "change the media")?;

        let mut room = self.rooms.get_mut(&room_id).ok_or(RoomError::NotFound)?;
        tracing::info!("{LOG_TAG} Room {} media set to {}", room_id, media_url);
        room.media_url = media_url;
        Ok(room_id)
    }

    pub fn subscribe(&self, client_id: Uuid, raw_topic: &str) -> Result<Topic, RoomError> {
        let topic = self.scoped_topic(client_id, raw_topic)?;
        if let Topic::SyncResponse {
            client_id: target, ..
        } = &topic
        {
            if *target != client_id.to_string() {
                return Err(RoomError::ForeignTopic(raw_topic.to_string()));
            }
        }

        self.subscribers
            .entry(topic.clone())
            .or_default()
            .insert(client_id);
        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.topics.insert(topic.clone());
        }
        tracing::debug!("{LOG_TAG} Client {} subscribed to {}", client_id, topic);
        Ok(topic)
    }

    pub fn unsubscribe(&self, client_id: Uuid, raw_topic: &str) {
        let Some(topic) = Topic::parse(raw_topic) else {
            return;
        };
        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.topics.remove(&topic);
        }
        self.remove_subscriber(&topic, client_id);
    }

    /// Check that `client_id` may publish on `raw_topic`.
    pub fn authorize_publish(&self, client_id: Uuid, raw_topic: &str) -> Result<Topic, RoomError> {
        let topic = self.scoped_topic(client_id, raw_topic)?;
        match topic {
            Topic::SyncRequest(_) => Ok(topic),
            Topic::Control(_) | Topic::SyncResponse { .. } => {
                if self.leader_of(topic.room_id()) == Some(client_id) {
                    Ok(topic)
                } else {
                    Err(RoomError::NotLeader("publish on this topic"))
                }
            }
            Topic::Leadership(_) => Err(RoomError::PublishDenied(raw_topic.to_string())),
        }
    }

    pub fn subscribers(&self, topic: &Topic) -> Vec<Uuid> {
        self.subscribers
            .get(topic)
            .map(|entry| entry.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn leader_of(&self, room_id: &str) -> Option<Uuid> {
        self.rooms.get(room_id).map(|room| room.leader_id)
    }

    pub fn room_of(&self, client_id: Uuid) -> Option<String> {
        self.clients.get(&client_id).and_then(|c| c.room_id.clone())
    }

    pub async fn get_room_members(&self, room_id: &str) -> Vec<Uuid> {
        match self.members_lock(room_id) {
            Some(members) => members.read().await.clone(),
            None => Vec::new(),
        }
    }

    pub fn add_client(&self, client_id: Uuid) {
        self.clients.insert(client_id, ClientInfo::default());
        tracing::info!("{LOG_TAG} Client {} connected", client_id);
    }

    pub async fn remove_client(&self, client_id: Uuid) -> Option<LeaveOutcome> {
        let outcome = self.leave_room(client_id).await;
        self.clients.remove(&client_id);
        tracing::info!("{LOG_TAG} Client {} disconnected", client_id);
        outcome
    }

    fn members_lock(&self, room_id: &str) -> Option<Arc<RwLock<Vec<Uuid>>>> {
        self.room_members
            .get(room_id)
            .map(|members| Arc::clone(&*members))
    }

    fn require_leader(&self, client_id: Uuid, action: &'static str) -> Result<String, RoomError> {
        let room_id = self.room_of(client_id).ok_or(RoomError::NotInRoom)?;
        match self.leader_of(&room_id) {
            Some(leader) if leader == client_id => Ok(room_id),
            Some(_) => Err(RoomError::NotLeader(action)),
            None => Err(RoomError::NotFound),
        }
    }

    /// Parse a topic and require it to belong to the client's room.
    fn scoped_topic(&self, client_id: Uuid, raw_topic: &str) -> Result<Topic, RoomError> {
        let topic =
            Topic::parse(raw_topic).ok_or_else(|| RoomError::InvalidTopic(raw_topic.to_string()))?;
        let room_id = self.room_of(client_id).ok_or(RoomError::NotInRoom)?;
        if topic.room_id() != room_id {
            return Err(RoomError::ForeignTopic(raw_topic.to_string()));
        }
        Ok(topic)
    }

    fn drop_subscriptions(&self, client_id: Uuid) {
        let topics = self
            .clients
            .get_mut(&client_id)
            .map(|mut client| std::mem::take(&mut client.topics))
            .unwrap_or_default();
        for topic in topics {
            self.remove_subscriber(&topic, client_id);
        }
    }

    fn remove_subscriber(&self, topic: &Topic, client_id: Uuid) {
        let now_empty = match self.subscribers.get_mut(topic) {
            Some(mut entry) => {
                entry.remove(&client_id);
                entry.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.subscribers.remove_if(topic, |_, set| set.is_empty());
        }
    }

    fn generate_room_code(&self) -> String {
        loop {
            let raw = (Uuid::new_v4().as_u128() % 1_000_000) as u32;
            let code = format!("{:03}-{:03}", raw / 1000, raw % 1000);
            if !self.rooms.contains_key(&code) {
                break code;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(state: &ServerState) -> Uuid {
        let id = Uuid::new_v4();
        state.add_client(id);
        id
    }

    #[test]
    fn test_room_codes_are_six_digits() {
        let state = ServerState::new();
        let leader = connected(&state);
        let code = state
            .create_room(leader, "https://cdn.example/movie.mp4".into())
            .unwrap();
        assert_eq!(code.len(), 7);
        assert_eq!(&code[3..4], "-");
        assert!(code
            .chars()
            .enumerate()
            .all(|(i, c)| i == 3 || c.is_ascii_digit()));
        assert_eq!(state.leader_of(&code), Some(leader));
        assert_eq!(
            state.create_room(leader, "  ".into()),
            Err(RoomError::EmptyMedia)
        );
    }

    #[tokio::test]
    async fn test_join_reports_role_and_media() {
        let state = ServerState::new();
        let leader = connected(&state);
        let guest = connected(&state);
        let room = state.create_room(leader, "media-a".into()).unwrap();

        let outcome = state.join_room(guest, &room).await.unwrap();
        assert!(!outcome.is_leader);
        assert_eq!(outcome.media_url, "media-a");
        assert_eq!(
            state.join_room(guest, "000-000x").await,
            Err(RoomError::NotFound)
        );
        assert_eq!(state.get_room_members(&room).await, vec![leader, guest]);
    }

    #[tokio::test]
    async fn test_longest_present_member_inherits_leadership() {
        let state = ServerState::new();
        let a = connected(&state);
        let b = connected(&state);
        let c = connected(&state);
        let room = state.create_room(a, "m".into()).unwrap();
        state.join_room(b, &room).await.unwrap();
        state.join_room(c, &room).await.unwrap();

        let outcome = state.remove_client(a).await.unwrap();
        assert_eq!(outcome.new_leader, Some(b));
        assert!(!outcome.room_closed);
        assert_eq!(state.leader_of(&room), Some(b));

        let outcome = state.leave_room(c).await.unwrap();
        assert_eq!(outcome.new_leader, None);

        let outcome = state.leave_room(b).await.unwrap();
        assert!(outcome.room_closed);
        assert!(state.rooms.get(&room).is_none());
        assert!(state.room_members.get(&room).is_none());
    }

    #[tokio::test]
    async fn test_hand_off_requires_leader_and_member_target() {
        let state = ServerState::new();
        let a = connected(&state);
        let b = connected(&state);
        let outsider = connected(&state);
        let room = state.create_room(a, "m".into()).unwrap();
        state.join_room(b, &room).await.unwrap();

        assert!(matches!(
            state.hand_off(b, b).await,
            Err(RoomError::NotLeader(_))
        ));
        assert_eq!(
            state.hand_off(a, outsider).await,
            Err(RoomError::NotMember(outsider))
        );
        assert_eq!(state.hand_off(a, b).await, Ok(room.clone()));
        assert_eq!(state.leader_of(&room), Some(b));
        assert!(matches!(
            state.select_media(a, "other".into()),
            Err(RoomError::NotLeader(_))
        ));
        assert_eq!(state.select_media(b, "other".into()), Ok(room.clone()));
        assert_eq!(state.rooms.get(&room).unwrap().media_url, "other");
    }

    #[tokio::test]
    async fn test_subscriptions_are_scoped_to_own_room_and_id() {
        let state = ServerState::new();
        let a = connected(&state);
        let b = connected(&state);
        let room = state.create_room(a, "m".into()).unwrap();
        let other = state.create_room(b, "n".into()).unwrap();

        let control = state.subscribe(a, &format!("control/{room}")).unwrap();
        assert_eq!(state.subscribers(&control), vec![a]);
        assert!(matches!(
            state.subscribe(a, &format!("control/{other}")),
            Err(RoomError::ForeignTopic(_))
        ));
        assert!(state
            .subscribe(a, &format!("sync-response/{room}/{a}"))
            .is_ok());
        assert!(matches!(
            state.subscribe(a, &format!("sync-response/{room}/{b}")),
            Err(RoomError::ForeignTopic(_))
        ));
        assert!(matches!(
            state.subscribe(a, "bogus"),
            Err(RoomError::InvalidTopic(_))
        ));

        state.unsubscribe(a, &format!("control/{room}"));
        assert!(state.subscribers(&control).is_empty());

        let leadership = state.subscribe(a, &format!("leadership/{room}")).unwrap();
        state.leave_room(a).await;
        assert!(state.subscribers(&leadership).is_empty());
    }

    #[tokio::test]
    async fn test_publish_authorisation() {
        let state = ServerState::new();
        let leader = connected(&state);
        let follower = connected(&state);
        let room = state.create_room(leader, "m".into()).unwrap();
        state.join_room(follower, &room).await.unwrap();

        let control = format!("control/{room}");
        let request = format!("sync-request/{room}");
        let response = format!("sync-response/{room}/{follower}");
        let leadership = format!("leadership/{room}");

        assert!(state.authorize_publish(leader, &control).is_ok());
        assert!(state.authorize_publish(leader, &response).is_ok());
        assert!(state.authorize_publish(follower, &request).is_ok());
        assert!(matches!(
            state.authorize_publish(follower, &control),
            Err(RoomError::NotLeader(_))
        ));
        assert!(matches!(
            state.authorize_publish(follower, &response),
            Err(RoomError::NotLeader(_))
        ));
        assert!(matches!(
            state.authorize_publish(leader, &leadership),
            Err(RoomError::PublishDenied(_))
        ));

        let outsider = connected(&state);
        assert_eq!(
            state.authorize_publish(outsider, &request),
            Err(RoomError::NotInRoom)
        );
    }
}
