//! Job tracking client for the Lumina backend.
//!
//! Provides the WebSocket status channel, status frame parsing, the
//! reconnect policy, the REST API client, and the [`JobTracker`] that
//! combines them to follow an asynchronous backend job to completion.

pub mod api;
pub mod channel;
pub mod messages;
pub mod reconnect;
mod session;
pub mod tracker;

pub use api::{ApiError, LuminaApi, StatusSource};
pub use channel::{ChannelError, StatusChannel, WsStatusChannel};
pub use tracker::{JobTracker, JobTracking, StopHandle, TrackOutcome, TrackerConfig, TrackerError};
