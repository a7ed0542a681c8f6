#![forbid(unsafe_code)]

// Lecture media-routing core: per-lecture SFU rooms, signaling, and the
// producer/consumer graph that fans one teacher's media out to students.

pub mod lecture;
pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;

pub use lecture::{AccessControl, AttendanceSink, Collaborators, LectureLifecycle, Role};
pub use media::MediaConfig;
pub use metrics::ServerMetrics;
pub use room::RoomManager;
pub use signaling::SignalingServer;
