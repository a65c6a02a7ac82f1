//! The closed error sum used across the queue core (spec §7).
//!
//! Every mutating service/repository method returns `Result<T>`. REST and MCP adapters
//! map variants to `{http_status, code, message}` through a single function so the two
//! wire surfaces never drift (see `moonmind_mcp::rest::map_error`).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Explicit code strings for skill-materialization failures (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializationCode {
    HashMismatch,
    MissingSkillMd,
    SkillNameMismatch,
    UnsafeBundleMember,
    BundleFetchFailed,
    UnsupportedBundle,
    UnsupportedSourceScheme,
    SourceNotFound,
    GitFetchFailed,
    DuplicateSkillName,
    WorkspaceLinkFailed,
    SignatureMissing,
}

impl MaterializationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HashMismatch => "hash_mismatch",
            Self::MissingSkillMd => "missing_skill_md",
            Self::SkillNameMismatch => "skill_name_mismatch",
            Self::UnsafeBundleMember => "unsafe_bundle_member",
            Self::BundleFetchFailed => "bundle_fetch_failed",
            Self::UnsupportedBundle => "unsupported_bundle",
            Self::UnsupportedSourceScheme => "unsupported_source_scheme",
            Self::SourceNotFound => "source_not_found",
            Self::GitFetchFailed => "git_fetch_failed",
            Self::DuplicateSkillName => "duplicate_skill_name",
            Self::WorkspaceLinkFailed => "workspace_link_failed",
            Self::SignatureMissing => "signature_missing",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Bad payloads, bad pagination, contract violations, secret-like manifest values,
    /// oversized artifacts. Maps to 422, or 413 when `is_too_large` is set.
    #[error("{message}")]
    Validation {
        message: String,
        is_too_large: bool,
    },

    /// Operation not permitted in the current job/live-session state. Maps to 409.
    #[error("{message}")]
    State { message: String },

    /// Worker does not own the active claim. Maps to 409.
    #[error("{message}")]
    Ownership { message: String },

    /// Job/artifact/token/proposal/live-session/manifest not found. Maps to 404.
    #[error("{code}: {message}")]
    NotFound { code: &'static str, message: String },

    /// Missing/invalid worker token. Maps to 401.
    #[error("{message}")]
    Authentication { message: String },

    /// Worker token does not match requested worker or capability/scope. Maps to 403.
    #[error("{message}")]
    Authorization { message: String },

    /// Authenticated user is not the creator/requester of the task run. Maps to 403.
    /// Kept distinct from `Authorization` per DESIGN.md open-question decision #1.
    #[error("{message}")]
    JobAuthorization { message: String },

    /// Task/manifest contract violation. Subclass of validation; maps to 422.
    #[error("{message}")]
    Contract { message: String },

    /// Skill materialization failure with an explicit code string. Surfaced verbatim.
    #[error("{code}: {message}")]
    Materialization {
        code: MaterializationCode,
        message: String,
    },

    /// Infrastructure failure (db, filesystem, network) that escaped a lower layer
    /// without being classified. Maps to 500.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            is_too_large: false,
        }
    }

    pub fn too_large(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            is_too_large: true,
        }
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    pub fn ownership(message: impl Into<String>) -> Self {
        Self::Ownership {
            message: message.into(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization {
            message: message.into(),
        }
    }

    pub fn job_authorization(message: impl Into<String>) -> Self {
        Self::JobAuthorization {
            message: message.into(),
        }
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::Contract {
            message: message.into(),
        }
    }

    pub fn materialization(code: MaterializationCode, message: impl Into<String>) -> Self {
        Self::Materialization {
            code,
            message: message.into(),
        }
    }

    /// Stable machine-readable code used by both REST and MCP error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { is_too_large, .. } => {
                if *is_too_large {
                    "artifact_too_large"
                } else {
                    "invalid_queue_payload"
                }
            }
            Self::State { .. } => "job_state_conflict",
            Self::Ownership { .. } => "job_ownership_mismatch",
            Self::NotFound { code, .. } => code,
            Self::Authentication { .. } => "worker_auth_failed",
            Self::Authorization { .. } => "worker_not_authorized",
            Self::JobAuthorization { .. } => "worker_not_authorized",
            Self::Contract { .. } => "invalid_manifest",
            Self::Materialization { code, .. } => code.as_str(),
            Self::Internal(_) => "internal_error",
        }
    }

    /// Normative HTTP status for the REST envelope (spec §7).
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { is_too_large, .. } => {
                if *is_too_large {
                    413
                } else {
                    422
                }
            }
            Self::State { .. } => 409,
            Self::Ownership { .. } => 409,
            Self::NotFound { .. } => 404,
            Self::Authentication { .. } => 401,
            Self::Authorization { .. } => 403,
            Self::JobAuthorization { .. } => 403,
            Self::Contract { .. } => 422,
            Self::Materialization { .. } => 422,
            Self::Internal(_) => 500,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(anyhow::anyhow!(err))
    }
}
