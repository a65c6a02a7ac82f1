//! CLI surface: a minimal stdio MCP server plus operator subcommands for manual
//! exercising (SPEC_FULL.md §0). Grounded on `crates/casparian/src/main.rs`'s
//! `Cli`/`Commands` shape (`clap::Parser` with global flags and a
//! `#[derive(Subcommand)]` enum), trimmed to this domain's handful of verbs.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "moonmind", about = "MoonMind agent-job queue")]
pub struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Path to a TOML config file; falls back to MOONMIND_* environment variables
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the stdio MCP server exposing the 9 queue verbs.
    Serve,

    /// Submit a job to the queue.
    Enqueue {
        /// task | manifest | codex_exec | codex_skill
        #[arg(long = "type")]
        job_type: String,
        /// JSON payload
        #[arg(long)]
        payload: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long)]
        affinity_key: Option<String>,
        #[arg(long, default_value_t = 5)]
        max_attempts: i32,
        #[arg(long)]
        created_by_user_id: Option<String>,
    },

    /// Claim the next eligible job for a worker token.
    Claim {
        #[arg(long)]
        worker_token: String,
        #[arg(long, default_value_t = 300)]
        lease_seconds: i64,
        /// Restrict to these job types (intersected with the token's own allowlist)
        #[arg(long = "type", value_delimiter = ',')]
        allowed_types: Vec<String>,
    },

    /// List jobs, optionally filtered by status/type.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long = "type")]
        job_type: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Toggle the global worker-pause control.
    Pause {
        /// Resume instead of pause
        #[arg(long)]
        resume: bool,
        #[arg(long, value_enum)]
        mode: Option<PauseModeArg>,
        /// Required when pausing
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        by: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum PauseModeArg {
    Drain,
    Quiesce,
}

impl PauseModeArg {
    pub fn as_core(self) -> moonmind_core::pause::PauseMode {
        match self {
            Self::Drain => moonmind_core::pause::PauseMode::Drain,
            Self::Quiesce => moonmind_core::pause::PauseMode::Quiesce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enqueue_subcommand() {
        let cli = Cli::try_parse_from([
            "moonmind",
            "enqueue",
            "--type",
            "task",
            "--payload",
            "{}",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Enqueue { .. }));
    }

    #[test]
    fn pause_mode_arg_round_trips_to_core() {
        assert_eq!(
            PauseModeArg::Drain.as_core(),
            moonmind_core::pause::PauseMode::Drain
        );
    }

    #[test]
    fn claim_requires_worker_token() {
        assert!(Cli::try_parse_from(["moonmind", "claim"]).is_err());
    }
}
