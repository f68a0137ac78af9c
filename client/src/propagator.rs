use std::sync::Arc;

use crate::channel::{publish_as, Channel};
use crate::echo::EchoGuard;
use crate::error::Result;
use crate::media::MediaElement;
use crate::protocol::{ControlMessage, Topic};

/// Local transport transitions that may become control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Play,
    Pause,
    Seeked,
}

/// Leader-side publisher of control messages.
///
/// The only component that publishes on `control/{room}`. Disabled while the
/// local client is a follower.
pub struct ControlPropagator {
    channel: Arc<dyn Channel>,
    topic: Topic,
    enabled: bool,
}

impl ControlPropagator {
    pub fn new(channel: Arc<dyn Channel>, room_id: &str, enabled: bool) -> Self {
        Self {
            channel,
            topic: Topic::control(room_id),
            enabled,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Publish the control message for a genuine local transition.
    ///
    /// Returns what was published, or `None` when disabled or suppressed.
    pub fn on_transport<M: MediaElement + ?Sized>(
        &self,
        transport: Transport,
        media: &M,
        guard: &mut EchoGuard,
    ) -> Result<Option<ControlMessage>> {
        if !self.enabled {
            return Ok(None);
        }
        if !guard.should_propagate() {
            tracing::debug!(?transport, "Suppressed echo of applied state");
            return Ok(None);
        }

        let time = media.current_time();
        let message = match transport {
            Transport::Play => ControlMessage::play(time),
            Transport::Pause => ControlMessage::pause(time),
            Transport::Seeked if media.is_playing() => ControlMessage::play(time),
            Transport::Seeked => ControlMessage::pause(time),
        };
        self.send(message, guard).map(Some)
    }

    /// Periodic `sync` while playback is progressing.
    pub fn heartbeat<M: MediaElement + ?Sized>(
        &self,
        media: &M,
        guard: &mut EchoGuard,
    ) -> Result<Option<ControlMessage>> {
        if !self.enabled || !media.is_playing() || !guard.should_propagate() {
            return Ok(None);
        }
        self.send(ControlMessage::sync(media.current_time()), guard)
            .map(Some)
    }

    fn send(&self, message: ControlMessage, guard: &mut EchoGuard) -> Result<ControlMessage> {
        guard.mark_local_origin();
        publish_as(self.channel.as_ref(), &self.topic, &message)?;
        tracing::debug!(
            action = ?message.action,
            time = message.time,
            topic = %self.topic,
            "Published control message"
        );
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Delivery, MemoryHub};
    use crate::media::SimulatedMedia;
    use crate::protocol::Action;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Fixture {
        propagator: ControlPropagator,
        media: SimulatedMedia,
        guard: EchoGuard,
        published: Arc<Mutex<Vec<Delivery>>>,
        _sub: crate::channel::Subscription,
    }

    fn fixture(enabled: bool) -> Fixture {
        let hub = MemoryHub::new();
        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&published);
        let observer = hub.connect("observer");
        let sub = observer
            .subscribe(&Topic::control("r"), Box::new(move |d| sink.lock().push(d)))
            .unwrap();
        let mut media = SimulatedMedia::new();
        media.load("file:///movie.mp4");
        Fixture {
            propagator: ControlPropagator::new(Arc::new(hub.connect("leader")), "r", enabled),
            media,
            guard: EchoGuard::new(Duration::from_millis(101)),
            published,
            _sub: sub,
        }
    }

    fn actions(published: &Mutex<Vec<Delivery>>) -> Vec<Action> {
        published
            .lock()
            .iter()
            .map(|d| ControlMessage::decode(&d.payload).unwrap().action)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_reports_current_play_state() {
        let mut f = fixture(true);
        f.media.seek(30.0);
        let sent = f
            .propagator
            .on_transport(Transport::Seeked, &f.media, &mut f.guard)
            .unwrap();
        assert_eq!(sent, Some(ControlMessage::pause(30.0)));

        tokio::time::advance(Duration::from_millis(200)).await;
        f.media.play().unwrap();
        let sent = f
            .propagator
            .on_transport(Transport::Seeked, &f.media, &mut f.guard)
            .unwrap();
        assert_eq!(sent, Some(ControlMessage::play(30.0)));
        assert_eq!(actions(&f.published), vec![Action::Pause, Action::Play]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_arms_guard_and_suppresses_followup() {
        let mut f = fixture(true);
        f.media.play().unwrap();
        f.propagator
            .on_transport(Transport::Play, &f.media, &mut f.guard)
            .unwrap();
        let second = f
            .propagator
            .on_transport(Transport::Pause, &f.media, &mut f.guard)
            .unwrap();
        assert_eq!(second, None);
        assert_eq!(actions(&f.published), vec![Action::Play]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_only_while_playing() {
        let mut f = fixture(true);
        assert_eq!(f.propagator.heartbeat(&f.media, &mut f.guard).unwrap(), None);

        f.media.seek(10.0);
        f.media.play().unwrap();
        let sent = f.propagator.heartbeat(&f.media, &mut f.guard).unwrap();
        assert_eq!(sent, Some(ControlMessage::sync(10.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_propagator_is_silent() {
        let mut f = fixture(false);
        f.media.play().unwrap();
        for transport in [Transport::Play, Transport::Pause, Transport::Seeked] {
            let sent = f
                .propagator
                .on_transport(transport, &f.media, &mut f.guard)
                .unwrap();
            assert_eq!(sent, None);
        }
        assert_eq!(f.propagator.heartbeat(&f.media, &mut f.guard).unwrap(), None);
        assert!(f.published.lock().is_empty());
        assert!(f.guard.should_propagate());
    }
}
