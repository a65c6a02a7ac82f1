//! Domain types shared by every MoonMind crate: ids, job/event/artifact/worker-token
//! records, the closed error sum, capability helpers, and configuration.

pub mod capability;
pub mod config;
pub mod error;
pub mod ids;
pub mod job;
pub mod live_session;
pub mod manifest_registry;
pub mod pause;
pub mod principal;
pub mod proposal;

pub use capability::{normalize_capabilities, subset_of};
pub use config::Config;
pub use error::{Error, Result};
pub use ids::{
    ArtifactId, EventId, JobId, LiveSessionId, ManifestRunId, ProposalId, WorkerTokenId,
};
pub use job::{
    Job, JobArtifact, JobEvent, JobEventLevel, JobStatus, JobType, STAGE_EXECUTE,
    STAGE_PREPARE, STAGE_PUBLISH,
};
pub use live_session::{
    LiveSessionProvider, LiveSessionStatus, TaskRunControlEvent, TaskRunLiveSession,
};
pub use manifest_registry::ManifestRegistryRecord;
pub use pause::{PauseMode, SystemControlEvent, SystemWorkerPauseState};
pub use principal::{AuthSource, Principal, WorkerPolicy};
pub use proposal::{OriginSource, ProposalStatus, ReviewPriority, SnoozeHistoryEntry, TaskProposal};
