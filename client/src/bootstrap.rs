use serde::Serialize;

use crate::channel::{publish_as, Channel};
use crate::error::Result;
use crate::protocol::{SyncRequest, Topic};
use crate::utils::current_unix_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapState {
    Idle,
    Requested,
    Fulfilled,
}

/// Follower-side one-shot snapshot request.
///
/// `Idle -> Requested` happens at most once per arming, when the media first
/// becomes ready. The leader answers point-to-point; the answer moves us to
/// `Fulfilled`. There is no retry: heartbeats correct a missing answer.
#[derive(Debug)]
pub struct SyncBootstrapper {
    request_topic: Topic,
    state: BootstrapState,
    enabled: bool,
}

impl SyncBootstrapper {
    pub fn new(room_id: &str, enabled: bool) -> Self {
        Self {
            request_topic: Topic::sync_request(room_id),
            state: BootstrapState::Idle,
            enabled,
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Media is ready: publish the request if the latch allows it.
    pub fn on_media_ready(&mut self, channel: &dyn Channel) -> Result<bool> {
        if !self.enabled || self.state != BootstrapState::Idle {
            return Ok(false);
        }
        // Latch before publishing so a failed publish is not retried either.
        self.state = BootstrapState::Requested;
        let request = SyncRequest {
            request_time: current_unix_millis(),
        };
        publish_as(channel, &self.request_topic, &request)?;
        tracing::info!(topic = %self.request_topic, "Requested playback snapshot from leader");
        Ok(true)
    }

    /// A response arrived. True when it completes our outstanding request.
    pub fn complete(&mut self) -> bool {
        if self.enabled && self.state == BootstrapState::Requested {
            self.state = BootstrapState::Fulfilled;
            true
        } else {
            false
        }
    }

    /// Leaders never bootstrap.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Allow one more request, after a demotion to follower.
    pub fn rearm(&mut self) {
        self.enabled = true;
        self.state = BootstrapState::Idle;
    }
}
