//! Minimal authenticated-caller type. OIDC/JWT verification itself is out of scope
//! (spec §1 Non-goals); the core only needs "is this an authenticated principal, and
//! what is its id".

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub is_operator: bool,
}

impl Principal {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_operator: false,
        }
    }

    pub fn operator(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_operator: true,
        }
    }
}

/// A worker's authenticated, frozen policy, resolved from a bearer token (spec §4.5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPolicy {
    pub worker_id: String,
    pub allowed_repositories: Option<Vec<String>>,
    pub allowed_job_types: Option<Vec<String>>,
    pub capabilities: Vec<String>,
    pub auth_source: AuthSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthSource {
    WorkerToken,
    Oidc,
}
