//! Manifest Registry Service: CRUD over named manifests, idempotent-by-hash
//! versioning, and submission of `manifest`-type queue jobs (spec §4.8).

pub mod service;

pub use service::ManifestRegistryService;
