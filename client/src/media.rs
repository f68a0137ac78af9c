use std::sync::Arc;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Notifications a media element raises, mirroring the platform callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    Play,
    Pause,
    Seeked,
    /// The resource is ready to play.
    Loaded,
    Error(String),
}

pub type MediaEventHandler = Arc<dyn Fn(MediaEvent) + Send + Sync>;

/// Capability interface over a platform media primitive.
///
/// State changes made through this trait raise the same events as user
/// interaction would, which is what the echo guard exists for.
pub trait MediaElement: Send {
    fn current_time(&self) -> f64;

    fn is_playing(&self) -> bool;

    /// Request playback. Platforms may refuse (autoplay policy, decode
    /// failure); the caller treats that as recoverable.
    fn play(&mut self) -> Result<()>;

    fn pause(&mut self);

    fn seek(&mut self, time: f64);

    /// Start loading `url`. Readiness is reported through [`MediaEvent::Loaded`].
    fn load(&mut self, url: &str);

    fn on_event(&mut self, handler: MediaEventHandler);

    /// Called before applying a command that came from the user directly.
    fn user_gesture(&mut self) {}
}

/// Clock-driven media element without any decoding.
///
/// Position advances with the tokio clock while playing, so tests running on
/// paused time see deterministic positions.
pub struct SimulatedMedia {
    duration: Option<f64>,
    ready: bool,
    position: f64,
    playing_since: Option<Instant>,
    autoplay_blocked: bool,
    activated: bool,
    handler: Option<MediaEventHandler>,
}

impl SimulatedMedia {
    pub fn new() -> Self {
        Self {
            duration: None,
            ready: false,
            position: 0.0,
            playing_since: None,
            autoplay_blocked: false,
            activated: false,
            handler: None,
        }
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Refuse `play()` until a user gesture, like a browser autoplay policy.
    pub fn with_autoplay_blocked(mut self) -> Self {
        self.autoplay_blocked = true;
        self
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn emit(&self, event: MediaEvent) {
        if let Some(handler) = &self.handler {
            handler(event);
        }
    }

    fn clamp(&self, time: f64) -> f64 {
        let time = time.max(0.0);
        match self.duration {
            Some(duration) => time.min(duration),
            None => time,
        }
    }
}

impl Default for SimulatedMedia {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaElement for SimulatedMedia {
    fn current_time(&self) -> f64 {
        let elapsed = self
            .playing_since
            .map(|since| since.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.clamp(self.position + elapsed)
    }

    fn is_playing(&self) -> bool {
        self.playing_since.is_some()
    }

    fn play(&mut self) -> Result<()> {
        if !self.ready {
            return Err(Error::Media("media is not ready".to_string()));
        }
        if self.autoplay_blocked && !self.activated {
            return Err(Error::Media(
                "playback blocked until the user interacts".to_string(),
            ));
        }
        if self.playing_since.is_none() {
            self.playing_since = Some(Instant::now());
            self.emit(MediaEvent::Play);
        }
        Ok(())
    }

    fn pause(&mut self) {
        if self.playing_since.is_some() {
            self.position = self.current_time();
            self.playing_since = None;
            self.emit(MediaEvent::Pause);
        }
    }

    fn seek(&mut self, time: f64) {
        self.position = self.clamp(time);
        if self.playing_since.is_some() {
            self.playing_since = Some(Instant::now());
        }
        self.emit(MediaEvent::Seeked);
    }

    fn load(&mut self, url: &str) {
        self.position = 0.0;
        self.playing_since = None;
        if url.trim().is_empty() {
            self.ready = false;
            self.emit(MediaEvent::Error("empty media locator".to_string()));
            return;
        }
        self.ready = true;
        self.emit(MediaEvent::Loaded);
    }

    fn on_event(&mut self, handler: MediaEventHandler) {
        self.handler = Some(handler);
    }

    fn user_gesture(&mut self) {
        self.activated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn recorded(media: &mut SimulatedMedia) -> Arc<Mutex<Vec<MediaEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        media.on_event(Arc::new(move |e| sink.lock().push(e)));
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_follows_clock_while_playing() {
        let mut media = SimulatedMedia::new();
        media.load("file:///movie.mp4");
        media.seek(10.0);
        media.play().unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(media.current_time(), 12.0);

        media.pause();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(media.current_time(), 12.0);
    }

    #[test]
    fn test_transitions_emit_once() {
        let mut media = SimulatedMedia::new();
        let events = recorded(&mut media);
        media.load("file:///movie.mp4");
        media.play().unwrap();
        media.play().unwrap();
        media.pause();
        media.pause();
        assert_eq!(
            *events.lock(),
            vec![MediaEvent::Loaded, MediaEvent::Play, MediaEvent::Pause]
        );
    }

    #[test]
    fn test_autoplay_block_lifts_after_gesture() {
        let mut media = SimulatedMedia::new().with_autoplay_blocked();
        media.load("file:///movie.mp4");
        assert!(media.play().is_err());
        media.user_gesture();
        assert!(media.play().is_ok());
        assert!(media.is_playing());
    }

    #[test]
    fn test_seek_is_clamped_to_duration() {
        let mut media = SimulatedMedia::new().with_duration(60.0);
        media.load("file:///movie.mp4");
        media.seek(90.0);
        assert_eq!(media.current_time(), 60.0);
        media.seek(-3.0);
        assert_eq!(media.current_time(), 0.0);
    }

    #[test]
    fn test_empty_locator_reports_error() {
        let mut media = SimulatedMedia::new();
        let events = recorded(&mut media);
        media.load("  ");
        assert!(!media.is_ready());
        assert!(matches!(events.lock()[0], MediaEvent::Error(_)));
    }
}
