//! Per-session synchronization state machine.
//!
//! [`SyncEngine`] owns the media element and every latch of one room
//! session. It is driven by exactly one task (see [`crate::session`]), so
//! nothing here locks. Handlers never fail outward: malformed input and
//! publish failures are logged and dropped, playback problems become
//! [`SessionEvent`]s.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::bootstrap::SyncBootstrapper;
use crate::channel::{publish_as, Channel, Delivery};
use crate::config::SyncConfig;
use crate::drift::DriftCorrector;
use crate::echo::EchoGuard;
use crate::error::Result;
use crate::leadership::{LeadershipMonitor, Role, RoleTransition};
use crate::media::{MediaElement, MediaEvent};
use crate::propagator::{ControlPropagator, Transport};
use crate::protocol::{
    Action, ControlMessage, LeadershipChange, SyncRequest, SyncResponse, Topic,
};
use crate::session::{PlaybackSnapshot, RoomSession, SessionEvent, UserCommand};

pub struct SyncEngine<M: MediaElement> {
    room: RoomSession,
    channel: Arc<dyn Channel>,
    media: M,
    guard: EchoGuard,
    drift: DriftCorrector,
    propagator: ControlPropagator,
    bootstrapper: SyncBootstrapper,
    leadership: LeadershipMonitor,
    media_ready: bool,
    /// Set while the platform refuses `play()`; lets a follower resume by hand.
    playback_blocked: bool,
    pending: VecDeque<ControlMessage>,
    pending_limit: usize,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<M: MediaElement> SyncEngine<M> {
    pub fn new(
        room: RoomSession,
        channel: Arc<dyn Channel>,
        media: M,
        config: &SyncConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let is_leader = room.role.is_leader();
        Self {
            propagator: ControlPropagator::new(Arc::clone(&channel), &room.room_id, is_leader),
            bootstrapper: SyncBootstrapper::new(&room.room_id, !is_leader),
            leadership: LeadershipMonitor::new(room.client_id.clone(), room.role),
            guard: EchoGuard::new(config.echo_window()),
            drift: DriftCorrector::new(config.drift_threshold_secs),
            pending: VecDeque::new(),
            pending_limit: config.pending_queue_limit,
            media_ready: false,
            playback_blocked: false,
            room,
            channel,
            media,
            events,
        }
    }

    /// Topics this engine consumes. All of them are held for the whole
    /// session, whatever the current role.
    pub fn topics(&self) -> Vec<Topic> {
        let room = &self.room.room_id;
        vec![
            Topic::control(room),
            Topic::sync_request(room),
            Topic::sync_response(room, &self.room.client_id),
            Topic::leadership(room),
        ]
    }

    pub fn role(&self) -> Role {
        self.leadership.role()
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut M {
        &mut self.media
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            position: self.media.current_time(),
            is_playing: self.media.is_playing(),
            role: self.role(),
            ready: self.media_ready,
            playback_blocked: self.playback_blocked,
            bootstrap: self.bootstrapper.state(),
        }
    }

    pub fn load_media(&mut self) {
        tracing::info!(room = %self.room.room_id, url = %self.room.media_url, "Loading media");
        self.media.load(&self.room.media_url);
    }

    pub fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Play => self.propagate(Transport::Play),
            MediaEvent::Pause => self.propagate(Transport::Pause),
            MediaEvent::Seeked => self.propagate(Transport::Seeked),
            MediaEvent::Loaded => self.on_media_ready(),
            MediaEvent::Error(reason) => {
                tracing::warn!(room = %self.room.room_id, "Media failed: {reason}");
                self.media_ready = false;
                self.emit(SessionEvent::MediaFailed { reason });
            }
        }
    }

    pub fn handle_delivery(&mut self, delivery: Delivery) {
        if delivery.topic.room_id() != self.room.room_id {
            tracing::debug!(topic = %delivery.topic, "Ignoring delivery for another room");
            return;
        }

        let result = match &delivery.topic {
            Topic::Control(_) => self.on_control(&delivery),
            Topic::SyncRequest(_) => self.on_sync_request(&delivery),
            Topic::SyncResponse { client_id, .. } if *client_id == self.room.client_id => {
                self.on_sync_response(&delivery)
            }
            Topic::Leadership(_) => self.on_leadership(&delivery),
            Topic::SyncResponse { .. } => Ok(()),
        };

        if let Err(e) = result {
            tracing::warn!(
                topic = %delivery.topic,
                from = %delivery.from,
                "Dropped inbound message: {e}"
            );
        }
    }

    /// Apply a transport command from the local user.
    ///
    /// Followers may only resume a playback the platform refused; any other
    /// local change would pull them away from the leader with nothing to
    /// correct it while the leader is paused.
    pub fn handle_command(&mut self, command: UserCommand) -> Result<()> {
        command.permitted(self.role(), self.playback_blocked)?;
        self.media.user_gesture();
        match command {
            UserCommand::Play => self.start_playback(),
            UserCommand::Pause => self.media.pause(),
            UserCommand::Seek(time) => self.media.seek(time.max(0.0)),
        }
        Ok(())
    }

    pub fn heartbeat(&mut self) {
        if let Err(e) = self.propagator.heartbeat(&self.media, &mut self.guard) {
            tracing::warn!(room = %self.room.room_id, "Failed to publish heartbeat: {e}");
        }
    }

    fn propagate(&mut self, transport: Transport) {
        if let Err(e) = self
            .propagator
            .on_transport(transport, &self.media, &mut self.guard)
        {
            tracing::warn!(?transport, "Failed to publish control message: {e}");
        }
    }

    fn on_media_ready(&mut self) {
        self.media_ready = true;
        if let Err(e) = self.bootstrapper.on_media_ready(self.channel.as_ref()) {
            tracing::warn!(room = %self.room.room_id, "Failed to request playback snapshot: {e}");
        }

        let queued = std::mem::take(&mut self.pending);
        if !queued.is_empty() {
            tracing::debug!(
                count = queued.len(),
                "Replaying control messages received before media was ready"
            );
        }
        for message in queued {
            self.apply_control(message);
        }
    }

    fn on_control(&mut self, delivery: &Delivery) -> Result<()> {
        let message = ControlMessage::decode(&delivery.payload)?;

        if self.role().is_leader() && delivery.from == self.room.client_id {
            tracing::trace!(action = ?message.action, "Skipping our own control message");
            return Ok(());
        }
        if !self.guard.should_propagate() {
            tracing::debug!(
                action = ?message.action,
                "Ignoring control message inside echo window"
            );
            return Ok(());
        }
        if !self.media_ready {
            self.enqueue(message);
            return Ok(());
        }

        self.apply_control(message);
        Ok(())
    }

    fn enqueue(&mut self, message: ControlMessage) {
        if self.pending.len() >= self.pending_limit {
            self.pending.pop_front();
        }
        self.pending.push_back(message);
    }

    fn apply_control(&mut self, message: ControlMessage) {
        let local = self.media.current_time();
        let decision = self.drift.reconcile(message.time, local);
        if decision.snap {
            tracing::debug!(
                local,
                remote = message.time,
                "Drift above threshold, seeking"
            );
            self.media.seek(decision.target_time);
        }

        match message.action {
            Action::Play => self.start_playback(),
            Action::Pause => self.stop_playback(),
            Action::Sync => {}
        }
    }

    fn start_playback(&mut self) {
        match self.media.play() {
            Ok(()) => self.playback_blocked = false,
            Err(e) => {
                tracing::warn!(room = %self.room.room_id, "Playback rejected: {e}");
                self.playback_blocked = true;
                self.emit(SessionEvent::PlaybackRejected {
                    reason: e.to_string(),
                });
            }
        }
    }

    fn stop_playback(&mut self) {
        self.playback_blocked = false;
        self.media.pause();
    }

    fn on_sync_request(&mut self, delivery: &Delivery) -> Result<()> {
        let request = SyncRequest::decode(&delivery.payload)?;
        if !self.role().is_leader() || delivery.from == self.room.client_id {
            return Ok(());
        }

        let response = SyncResponse {
            current_time: self.media.current_time(),
            is_playing: self.media.is_playing(),
        };
        let topic = Topic::sync_response(&self.room.room_id, &delivery.from);
        publish_as(self.channel.as_ref(), &topic, &response)?;
        tracing::info!(
            requester = %delivery.from,
            requested_at = request.request_time,
            position = response.current_time,
            playing = response.is_playing,
            "Answered playback snapshot request"
        );
        Ok(())
    }

    fn on_sync_response(&mut self, delivery: &Delivery) -> Result<()> {
        let response = SyncResponse::decode(&delivery.payload)?;
        if self.role().is_leader() || !self.bootstrapper.complete() {
            tracing::debug!(from = %delivery.from, "Ignoring unsolicited sync response");
            return Ok(());
        }

        // Initial alignment is exact: no drift threshold here.
        self.media.seek(response.current_time);
        if response.is_playing {
            self.start_playback();
        } else {
            self.stop_playback();
        }
        tracing::info!(
            position = response.current_time,
            playing = response.is_playing,
            "Bootstrapped from leader snapshot"
        );
        self.emit(SessionEvent::Bootstrapped {
            position: response.current_time,
            is_playing: response.is_playing,
        });
        Ok(())
    }

    fn on_leadership(&mut self, delivery: &Delivery) -> Result<()> {
        let change = LeadershipChange::decode(&delivery.payload)?;
        match self.leadership.observe(&change) {
            Some(RoleTransition::Promoted) => {
                self.propagator.set_enabled(true);
                self.bootstrapper.disable();
                self.pending.clear();
                tracing::info!(room = %self.room.room_id, "Promoted to leader");
                self.emit(SessionEvent::RoleChanged(Role::Leader));
            }
            Some(RoleTransition::Demoted) => {
                self.propagator.set_enabled(false);
                self.bootstrapper.rearm();
                tracing::info!(
                    room = %self.room.room_id,
                    new_leader = %change.new_leader_id,
                    "Demoted to follower"
                );
                self.emit(SessionEvent::RoleChanged(Role::Follower));
                // Readiness will not fire again for loaded media.
                if self.media_ready {
                    self.bootstrapper.on_media_ready(self.channel.as_ref())?;
                }
            }
            None => {}
        }
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
