//! Task Payload Contract (spec §4.3) and Manifest Contract (spec §4.4).

pub mod manifest;
pub mod task;

pub use manifest::{normalize_manifest_payload, sanitize_manifest_for_response, ManifestView};
pub use task::{
    build_canonical_task_view, build_task_stage_plan, normalize_queue_job_payload,
    CanonicalTaskView,
};
