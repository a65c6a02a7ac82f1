//! Queue Service policy layer, Live Session Core, and Artifact Storage (spec §4.2,
//! §4.5, §4.6), layered on top of `moonmind_db::Repository` and
//! `moonmind_contracts`'s payload normalization.

pub mod artifacts;
pub mod cancel;
pub mod live_session;
pub mod service;

pub use artifacts::ArtifactStore;
pub use cancel::{sync_cancellation, CancellationToken};
pub use live_session::{LiveSessionConfig, LiveSessionService};
pub use service::{MigrationTelemetry, QueueService, QueueServiceConfig};
