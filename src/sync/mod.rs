pub mod aggregator; // Single owner of the merged session view
pub mod connection; // Push-channel lifecycle + reconnect state machine
pub mod heartbeat; // Liveness probe/response protocol
pub mod poller; // Pull-polling fallback loops
pub mod rest; // Monitor REST endpoints
pub mod timeline; // Bounded derived-event buffer
pub mod wire; // Push-channel frame contract

pub use aggregator::{SessionAggregator, SessionToken};
pub use connection::ConnectionManager;
pub use poller::{FieldUpdate, PollCoordinator, SnapshotSource};
pub use rest::{AudioMetricsSource, MonitorApi, VideoStatisticsSource};
pub use timeline::{EventCategory, TimelineEvent, TimelineRecorder};
pub use wire::{decode_frame, Envelope, FrameKind, Inbound};
