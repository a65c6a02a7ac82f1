//! Runtime configuration (spec §6 "Configuration"; SPEC_FULL.md §9.3).
//!
//! Grounded on the teacher's `casparian_db::pool::DbConfig` builder-constructor idiom,
//! generalized to the full knob list and layered: TOML file, then `MOONMIND_*`
//! environment overrides via `clap(env)`. Unknown TOML keys are rejected.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillPolicyMode {
    Allowlist,
    Permissive,
}

#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
#[command(name = "moonmind-config")]
pub struct Config {
    #[arg(long, env = "MOONMIND_ARTIFACT_ROOT", default_value = "./data/artifacts")]
    pub artifact_root: PathBuf,

    #[arg(long, env = "MOONMIND_ARTIFACT_MAX_BYTES", default_value_t = 50 * 1024 * 1024)]
    pub artifact_max_bytes: i64,

    #[arg(long, env = "MOONMIND_RETRY_BACKOFF_BASE_SECONDS", default_value_t = 5)]
    pub retry_backoff_base_seconds: i64,

    #[arg(long, env = "MOONMIND_RETRY_BACKOFF_MAX_SECONDS", default_value_t = 900)]
    pub retry_backoff_max_seconds: i64,

    #[arg(long, env = "MOONMIND_DEFAULT_RETRY_DELAY_SECONDS", default_value_t = 30)]
    pub default_retry_delay_seconds: i64,

    #[arg(long, env = "MOONMIND_LIVE_SESSION_PROVIDER", default_value = "tmate")]
    pub live_session_provider: String,

    #[arg(long, env = "MOONMIND_LIVE_SESSION_TTL_MINUTES", default_value_t = 15)]
    pub live_session_ttl_minutes: i64,

    #[arg(
        long,
        env = "MOONMIND_LIVE_SESSION_RW_GRANT_TTL_MINUTES",
        default_value_t = 30
    )]
    pub live_session_rw_grant_ttl_minutes: i64,

    #[arg(long, env = "MOONMIND_LIVE_SESSION_ALLOW_WEB", default_value_t = false)]
    pub live_session_allow_web: bool,

    #[arg(long, env = "MOONMIND_DEFAULT_PUBLISH_MODE", default_value = "pr")]
    pub default_publish_mode: String,

    #[arg(long, env = "MOONMIND_DEFAULT_TARGET_RUNTIME", default_value = "codex")]
    pub default_target_runtime: String,

    #[arg(long, env = "MOONMIND_MANIFEST_REQUIRED_CAPABILITIES", value_delimiter = ',', default_value = "manifest")]
    pub manifest_required_capabilities: Vec<String>,

    #[arg(long, env = "MOONMIND_ALLOW_MANIFEST_PATH_SOURCE", default_value_t = false)]
    pub allow_manifest_path_source: bool,

    #[arg(long, env = "MOONMIND_SKILLS_LOCAL_MIRROR_ROOT")]
    pub skills_local_mirror_root: Option<PathBuf>,

    #[arg(long, env = "MOONMIND_SKILLS_LEGACY_MIRROR_ROOT")]
    pub skills_legacy_mirror_root: Option<PathBuf>,

    #[arg(long, env = "MOONMIND_SKILL_POLICY_MODE", default_value = "allowlist")]
    pub skill_policy_mode: String,

    #[arg(long, env = "MOONMIND_ALLOWED_SKILLS", value_delimiter = ',')]
    pub allowed_skills: Vec<String>,

    #[arg(long, env = "MOONMIND_DEFAULT_SKILL", default_value = "speckit")]
    pub default_skill: String,

    #[arg(long, env = "MOONMIND_NOTIFICATIONS_WEBHOOK_URL")]
    pub notifications_webhook_url: Option<String>,

    #[arg(long, env = "MOONMIND_NOTIFICATIONS_AUTHORIZATION")]
    pub notifications_authorization: Option<String>,

    #[arg(long, env = "MOONMIND_NOTIFICATIONS_TIMEOUT_SECONDS", default_value_t = 5)]
    pub notifications_timeout_seconds: u64,

    #[arg(long, env = "MOONMIND_NOTIFICATIONS_ENABLED", default_value_t = false)]
    pub notifications_enabled: bool,

    #[arg(long, env = "MOONMIND_CI_REPOSITORY", default_value = "MoonMind/moonmind-ci")]
    pub moonmind_ci_repository: String,

    #[arg(long, env = "MOONMIND_DATABASE_URL", default_value = "sqlite::memory:")]
    pub database_url: String,

    #[arg(long, env = "MOONMIND_HOME")]
    pub moonmind_home: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        // Parsing an empty arg slice applies every `default_value`/`default_value_t`
        // above; this keeps the single source of truth for defaults in the `clap`
        // attributes instead of duplicating them here.
        Config::parse_from::<_, &str>([])
    }
}

impl Config {
    /// Load an optional TOML file, falling back to `MOONMIND_*` environment variables
    /// (via `clap`'s `env` attribute) for any field the file doesn't set, then
    /// hard-coded defaults for anything neither sets. Unknown TOML keys are rejected
    /// via `deny_unknown_fields` (spec §6 "reject unknown").
    pub fn from_env_and_file(toml_path: Option<&std::path::Path>) -> Result<Self> {
        match toml_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| Error::validation(format!("failed to read {path:?}: {e}")))?;
                toml::from_str(&text)
                    .map_err(|e| Error::validation(format!("invalid config file {path:?}: {e}")))
            }
            // `parse_from([])` evaluates every field's `env = "..."` fallback before
            // applying its `default_value`, so this alone covers the env-only case.
            None => Ok(Config::parse_from::<_, &str>([])),
        }
    }

    pub fn skill_policy_mode(&self) -> Result<SkillPolicyMode> {
        match self.skill_policy_mode.as_str() {
            "allowlist" => Ok(SkillPolicyMode::Allowlist),
            "permissive" => Ok(SkillPolicyMode::Permissive),
            other => Err(Error::validation(format!(
                "unknown skill_policy_mode '{other}'"
            ))),
        }
    }

    pub fn moonmind_home(&self) -> PathBuf {
        self.moonmind_home.clone().unwrap_or_else(|| {
            dirs_home().join(".moonmind")
        })
    }
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_narrative() {
        let config = Config::default();
        assert_eq!(config.default_publish_mode, "pr");
        assert_eq!(config.retry_backoff_base_seconds, 5);
        assert_eq!(config.artifact_max_bytes, 50 * 1024 * 1024);
        assert_eq!(config.live_session_ttl_minutes, 15);
        assert_eq!(config.skill_policy_mode, "allowlist");
    }
}
