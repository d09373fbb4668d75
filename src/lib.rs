//! Realtime session synchronization engine for the emotion monitor.
//!
//! Maintains a live, consistent view of one monitoring session fed by a
//! push channel (with reconnect and heartbeat liveness) and two independent
//! poll loops, merged under a token-gated last-writer-wins-per-field policy.

pub mod config;
pub mod models;
pub mod sync;

pub use config::SyncConfig;
pub use models::{
    AgentPatch, AgentView, AudioPatch, AudioStatus, AudioView, ConnectionInfo, ConnectionState,
    FinalVerdict, SessionView, VideoPatch, VideoView,
};
