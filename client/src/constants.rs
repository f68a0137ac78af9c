pub const LOCAL_WS_URL: &str = "ws://localhost:3005/ws";
pub const REMOTE_WS_URL: &str = "wss://lockstep.onrender.com/ws";

/// Current application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Local and authoritative positions may differ by this much before we seek.
pub const DRIFT_THRESHOLD_SECS: f64 = 1.5;
/// Offset from the 2000 ms heartbeat some peers run, so ticks do not align.
pub const HEARTBEAT_INTERVAL_MS: u64 = 2001;
pub const ECHO_WINDOW_MS: u64 = 101;
pub const PENDING_QUEUE_LIMIT: usize = 32;
