use std::time::Duration;
use tokio::time::Instant;

/// Suppresses re-publishing of media transitions caused by our own publishes.
///
/// Applying a position or play state programmatically fires the same media
/// events as a user action would. The guard is armed right before a local
/// publish and stays armed for `window`; while armed, local transitions are
/// not propagated and inbound control messages are not applied.
#[derive(Debug, Clone)]
pub struct EchoGuard {
    window: Duration,
    armed_until: Option<Instant>,
}

impl EchoGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            armed_until: None,
        }
    }

    pub fn should_propagate(&self) -> bool {
        match self.armed_until {
            Some(deadline) => Instant::now() >= deadline,
            None => true,
        }
    }

    pub fn mark_local_origin(&mut self) {
        self.armed_until = Some(Instant::now() + self.window);
    }
}
