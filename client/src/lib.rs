//! Leader/follower playback synchronization over a pub/sub channel.
//!
//! The leader of a room publishes transport controls and heartbeats; every
//! follower converges its local media element to them, bootstrapping once
//! from a point-to-point snapshot when it joins. See [`session::start`].

pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod constants;
pub mod drift;
pub mod echo;
pub mod engine;
pub mod error;
pub mod invite;
pub mod leadership;
pub mod media;
pub mod propagator;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod utils;

pub use channel::{Channel, Delivery, MemoryHub, Subscription};
pub use config::{ClientConfig, SyncConfig};
pub use error::{Error, Result};
pub use leadership::Role;
pub use media::{MediaElement, MediaEvent, SimulatedMedia};
pub use relay::RelayClient;
pub use session::{start, PlaybackSnapshot, RoomSession, SessionEvent, SessionHandle};
