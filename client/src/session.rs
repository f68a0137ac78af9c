//! Session lifetime: one task per room session.
//!
//! [`start`] acquires the topic subscriptions and the heartbeat timer, then
//! hands them to a single task that drives the [`SyncEngine`]. Ending the
//! session (explicitly, or by dropping the [`SessionHandle`]) stops that
//! task, which releases the timer and every subscription together.

use serde::Serialize;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::bootstrap::BootstrapState;
use crate::channel::{Channel, Delivery, Subscription};
use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::error::{Error, Result};
use crate::leadership::Role;
use crate::media::{MediaElement, MediaEvent};
use crate::protocol::Topic;

/// The shared playback context this client takes part in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSession {
    pub room_id: String,
    /// Identity the channel stamps on our publishes.
    pub client_id: String,
    /// Initial role. Later changes come only from leadership notifications.
    pub role: Role,
    pub media_url: String,
}

/// Notifications for the surrounding application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    RoleChanged(Role),
    /// `play()` was refused; the user has to resume manually.
    PlaybackRejected { reason: String },
    MediaFailed { reason: String },
    Bootstrapped { position: f64, is_playing: bool },
}

/// Transport actions taken by the local user.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UserCommand {
    Play,
    Pause,
    Seek(f64),
}

impl UserCommand {
    /// Leaders may do anything. Followers may only resume after a rejected `play()`.
    pub(crate) fn permitted(self, role: Role, playback_blocked: bool) -> Result<()> {
        match (role, self) {
            (Role::Leader, _) => Ok(()),
            (Role::Follower, UserCommand::Play) if playback_blocked => Ok(()),
            (Role::Follower, UserCommand::Play) => Err(Error::NotLeader("start playback")),
            (Role::Follower, UserCommand::Pause) => Err(Error::NotLeader("pause")),
            (Role::Follower, UserCommand::Seek(_)) => Err(Error::NotLeader("seek")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackSnapshot {
    pub position: f64,
    pub is_playing: bool,
    pub role: Role,
    pub ready: bool,
    pub playback_blocked: bool,
    pub bootstrap: BootstrapState,
}

pub struct SessionHandle {
    room_id: String,
    commands: mpsc::UnboundedSender<UserCommand>,
    snapshot: watch::Receiver<PlaybackSnapshot>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn play(&self) -> Result<()> {
        self.send(UserCommand::Play)
    }

    pub fn pause(&self) -> Result<()> {
        self.send(UserCommand::Pause)
    }

    pub fn seek(&self, time: f64) -> Result<()> {
        self.send(UserCommand::Seek(time))
    }

    /// Queue a command for the session task. Commands the current role may
    /// not issue are refused here; the task checks again on arrival.
    pub fn send(&self, command: UserCommand) -> Result<()> {
        {
            let snapshot = self.snapshot.borrow();
            command.permitted(snapshot.role, snapshot.playback_blocked)?;
        }
        self.commands
            .send(command)
            .map_err(|_| Error::SessionEnded)
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.snapshot.clone()
    }

    /// The event stream can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    /// Stop the session and wait until its timer and subscriptions are released.
    pub async fn end(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(room = %self.room_id, "Session task failed: {e}");
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start synchronizing `media` with the room. Must be called inside a tokio runtime.
pub fn start<M>(
    room: RoomSession,
    channel: Arc<dyn Channel>,
    mut media: M,
    config: &SyncConfig,
) -> Result<SessionHandle>
where
    M: MediaElement + 'static,
{
    config.validate()?;

    let mut media_rx = wire_media(&mut media);
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();

    let room_id = room.room_id.clone();
    let mut engine = SyncEngine::new(room, Arc::clone(&channel), media, config, event_tx);
    let subscriptions = subscribe_topics(channel.as_ref(), &engine.topics(), &inbound_tx)?;
    drop(inbound_tx);

    // Subscribed first, so the bootstrap answer cannot be missed.
    engine.load_media();

    let (snapshot_tx, snapshot_rx) = watch::channel(engine.snapshot());
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let period = config.heartbeat_interval();
    let task_room = room_id.clone();

    tracing::info!(room = %room_id, role = ?engine.role(), "Session started");

    let task = tokio::spawn(async move {
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(event) = media_rx.recv() => engine.handle_media_event(event),
                Some(delivery) = inbound_rx.recv() => engine.handle_delivery(delivery),
                Some(command) = command_rx.recv() => {
                    if let Err(e) = engine.handle_command(command) {
                        tracing::warn!(room = %task_room, ?command, "Refused command: {e}");
                    }
                }
                _ = heartbeat.tick() => engine.heartbeat(),
            }
            snapshot_tx.send_replace(engine.snapshot());
        }

        drop(subscriptions);
        drop(heartbeat);
        tracing::info!(room = %task_room, "Session ended");
    });

    Ok(SessionHandle {
        room_id,
        commands: command_tx,
        snapshot: snapshot_rx,
        events: Some(event_rx),
        cancel,
        task: Some(task),
    })
}

pub(crate) fn wire_media<M: MediaElement>(media: &mut M) -> mpsc::UnboundedReceiver<MediaEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    media.on_event(Arc::new(move |event| {
        let _ = tx.send(event);
    }));
    rx
}

/// Subscribe to every topic, forwarding deliveries into `tx`. All or nothing.
pub(crate) fn subscribe_topics(
    channel: &dyn Channel,
    topics: &[Topic],
    tx: &mpsc::UnboundedSender<Delivery>,
) -> Result<Vec<Subscription>> {
    let mut subscriptions = Vec::with_capacity(topics.len());
    for topic in topics {
        let tx = tx.clone();
        // Earlier subscriptions drop with the Vec on error.
        let subscription = channel.subscribe(
            topic,
            Box::new(move |delivery| {
                let _ = tx.send(delivery);
            }),
        )?;
        subscriptions.push(subscription);
    }
    Ok(subscriptions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryHub, SERVER_ORIGIN};
    use crate::media::SimulatedMedia;
    use crate::protocol::ControlMessage;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    const ROOM: &str = "123-456";

    fn join(hub: &MemoryHub, id: &str, role: Role) -> SessionHandle {
        let room = RoomSession {
            room_id: ROOM.into(),
            client_id: id.into(),
            role,
            media_url: "file:///movie.mp4".into(),
        };
        start(
            room,
            Arc::new(hub.connect(id)),
            SimulatedMedia::new(),
            &SyncConfig::default(),
        )
        .unwrap()
    }

    fn control_log(hub: &MemoryHub) -> (Arc<Mutex<Vec<(String, ControlMessage)>>>, Subscription) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let sub = hub
            .connect("observer")
            .subscribe(
                &Topic::control(ROOM),
                Box::new(move |d| {
                    if let Ok(msg) = ControlMessage::decode(&d.payload) {
                        sink.lock().push((d.from, msg));
                    }
                }),
            )
            .unwrap();
        (log, sub)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_joiner_converges() {
        let hub = MemoryHub::new();
        let leader = join(&hub, "leader", Role::Leader);
        settle().await;
        leader.seek(120.0).unwrap();
        leader.play().unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let follower = join(&hub, "follower", Role::Follower);
        settle().await;

        let lead = leader.snapshot();
        let follow = follower.snapshot();
        assert!(follow.is_playing);
        assert_eq!(follow.bootstrap, BootstrapState::Fulfilled);
        assert!((lead.position - follow.position).abs() < 0.1);
        assert!(follow.position > 149.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_follow_leader() {
        let hub = MemoryHub::new();
        let (log, _sub) = control_log(&hub);
        let leader = join(&hub, "leader", Role::Leader);
        settle().await;

        // Paused leaders stay quiet.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(log.lock().is_empty());

        leader.play().unwrap();
        tokio::time::sleep(Duration::from_millis(6100)).await;
        let log = log.lock();
        assert_eq!(log[0].1.action, crate::protocol::Action::Play);
        let syncs = log
            .iter()
            .filter(|(_, m)| m.action == crate::protocol::Action::Sync)
            .count();
        assert!(syncs >= 2, "expected heartbeats, got {log:?}");
        assert!(log.iter().all(|(from, _)| from == "leader"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_releases_timer_and_subscriptions() {
        let hub = MemoryHub::new();
        let (log, _sub) = control_log(&hub);
        let leader = join(&hub, "leader", Role::Leader);
        settle().await;
        assert_eq!(hub.subscriber_count(&Topic::control(ROOM)), 2);

        leader.play().unwrap();
        settle().await;
        leader.end().await;
        assert_eq!(hub.subscriber_count(&Topic::control(ROOM)), 1);
        assert_eq!(hub.subscriber_count(&Topic::leadership(ROOM)), 0);

        let published = log.lock().len();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(log.lock().len(), published);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_stays_with_paused_leader() {
        let hub = MemoryHub::new();
        let leader = join(&hub, "leader", Role::Leader);
        settle().await;
        leader.seek(30.0).unwrap();
        settle().await;

        let follower = join(&hub, "follower", Role::Follower);
        settle().await;
        assert!(matches!(follower.seek(500.0), Err(Error::NotLeader(_))));
        assert!(matches!(follower.play(), Err(Error::NotLeader(_))));
        assert!(matches!(follower.pause(), Err(Error::NotLeader(_))));

        tokio::time::sleep(Duration::from_secs(60)).await;
        let lead = leader.snapshot();
        let follow = follower.snapshot();
        assert_eq!(lead.position, 30.0);
        assert_eq!(follow.position, lead.position);
        assert!(!lead.is_playing);
        assert!(!follow.is_playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_after_end_fail() {
        let hub = MemoryHub::new();
        let session = join(&hub, "c", Role::Follower);
        let commands = session.commands.clone();
        session.end().await;
        assert!(commands.send(UserCommand::Play).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_change_moves_heartbeats() {
        let hub = MemoryHub::new();
        let (log, _sub) = control_log(&hub);
        let mut a = join(&hub, "a", Role::Leader);
        let mut b = join(&hub, "b", Role::Follower);
        let mut a_events = a.take_events().unwrap();
        let mut b_events = b.take_events().unwrap();
        settle().await;

        a.play().unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(b.snapshot().is_playing);

        hub.publish_from(SERVER_ORIGIN, &Topic::leadership(ROOM), json!({"newLeaderId": "b"}));
        settle().await;
        assert_eq!(a.snapshot().role, Role::Follower);
        assert_eq!(b.snapshot().role, Role::Leader);
        assert_eq!(a_events.recv().await, Some(SessionEvent::RoleChanged(Role::Follower)));
        assert!(matches!(b_events.recv().await, Some(SessionEvent::Bootstrapped { .. })));
        assert_eq!(b_events.recv().await, Some(SessionEvent::RoleChanged(Role::Leader)));

        log.lock().clear();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let log = log.lock();
        assert!(!log.is_empty());
        assert!(log.iter().all(|(from, _)| from == "b"), "{log:?}");
    }
}
