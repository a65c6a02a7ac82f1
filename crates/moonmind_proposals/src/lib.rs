//! Task Proposal Service: dedup, MoonMind-CI signal policy, review lifecycle
//! (spec §4.7).

pub mod dedup;
pub mod notify;
pub mod redact;
pub mod service;

pub use notify::NotifyConfig;
pub use redact::RedactorConfig;
pub use service::{CreateProposalRequest, ProposalService, ProposalServiceConfig};
