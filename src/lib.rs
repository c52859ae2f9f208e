//! Live progress tracking for backend ingestion jobs.
//!
//! A [`ProgressTracker`] follows one job session over a WebSocket, folds the
//! server's events into a [`ProgressState`] and watches the server's
//! heartbeats so a silently dead socket is noticed.

pub mod app;
pub mod config;
pub mod heartbeat;
pub mod model;
pub mod progress;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tracker;

pub use config::{Config, ConfigError, TrackerConfig};
pub use heartbeat::HeartbeatConfig;
pub use model::{ProgressSnapshot, ProgressState, ProgressStatus, SessionError};
pub use protocol::ProtocolEvent;
pub use session::{Connector, WsConnector};
pub use tracker::ProgressTracker;
