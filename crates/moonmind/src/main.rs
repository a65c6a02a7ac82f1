//! MoonMind queue daemon entrypoint: config loading, service composition, a minimal
//! stdio MCP server, and operator subcommands for manual exercising.
//!
//! Grounded on `crates/casparian/src/main.rs`'s launcher shape (`clap::Parser` CLI,
//! `tracing_subscriber` init, `mod cli;`) but stripped of its split-runtime/sentinel/
//! worker-process machinery: the queue core has no long-running job-execution engine
//! to launch here, only service composition in front of `moonmind_mcp::McpServer` and
//! `QueueService`.

use std::process::ExitCode;
use std::str::FromStr;

use anyhow::Context;
use clap::Parser;
use tracing::error;

use moonmind_core::config::Config;
use moonmind_core::error::Error as CoreError;
use moonmind_core::job::{JobStatus, JobType};
use moonmind_db::{create_pool, migrate, DbConfig, Repository};
use moonmind_logging::{init_logging, LogConfig};
use moonmind_mcp::{McpServer, McpServerConfig};
use moonmind_queue::{ArtifactStore, QueueService, QueueServiceConfig};

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig {
        app_name: "moonmind",
        verbose: cli.verbose,
        tui_mode: false,
    }) {
        eprintln!("failed to initialize logging: {e:#}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env_and_file(cli.config.as_deref())
        .context("failed to load configuration")?;

    let db_config = DbConfig::from_url(&config.database_url)?;
    let pool = create_pool(db_config).await?;
    migrate(&pool).await.context("failed to run database migrations")?;

    let repo = Repository::new(pool)
        .with_lease_retry_delay_seconds(config.default_retry_delay_seconds);

    let queue_config = QueueServiceConfig {
        default_target_runtime: config.default_target_runtime.clone(),
        default_publish_mode: config.default_publish_mode.clone(),
        artifact_max_bytes: config.artifact_max_bytes,
        allow_manifest_path_source: config.allow_manifest_path_source,
        retry_backoff_base_seconds: config.retry_backoff_base_seconds,
        retry_backoff_max_seconds: config.retry_backoff_max_seconds,
    };
    let artifacts = ArtifactStore::new(config.artifact_root.clone(), config.artifact_max_bytes);

    match cli.command {
        Commands::Serve => {
            let mut server = McpServer::new(McpServerConfig::default(), repo, queue_config, artifacts);
            server.run().await
        }
        Commands::Enqueue {
            job_type,
            payload,
            priority,
            affinity_key,
            max_attempts,
            created_by_user_id,
        } => {
            let service = QueueService::new(&repo, &queue_config);
            let job_type = JobType::from_str(&job_type)?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let job = service
                .create_job(
                    job_type,
                    payload,
                    priority,
                    created_by_user_id,
                    None,
                    affinity_key,
                    max_attempts,
                )
                .await?;
            print_json(&job)
        }
        Commands::Claim {
            worker_token,
            lease_seconds,
            allowed_types,
        } => {
            let service = QueueService::new(&repo, &queue_config);
            let policy = service.resolve_worker_token(&worker_token).await?;
            let requested_types = if allowed_types.is_empty() {
                None
            } else {
                Some(allowed_types.as_slice())
            };
            let job = service.claim_job(&policy, lease_seconds, requested_types).await?;
            print_json(&job)
        }
        Commands::List {
            status,
            job_type,
            limit,
        } => {
            let service = QueueService::new(&repo, &queue_config);
            let status = status.map(|s| JobStatus::from_str(&s)).transpose()?;
            let job_type = job_type.map(|t| JobType::from_str(&t)).transpose()?;
            let jobs = service.list_jobs(status, job_type, limit).await?;
            print_json(&jobs)
        }
        Commands::Pause {
            resume,
            mode,
            reason,
            by,
        } => {
            if !resume && reason.is_none() {
                return Err(CoreError::validation("reason is required when pausing").into());
            }
            let paused = !resume;
            let mode = if paused { mode.map(|m| m.as_core()) } else { None };
            let state = repo
                .update_pause_state(paused, mode, reason.clone(), by.clone(), Some(chrono::Utc::now()))
                .await?;
            let action = if paused { "pause" } else { "resume" };
            repo.append_system_control_event(
                action,
                by,
                Some(serde_json::json!({"mode": mode.map(|m| m.as_str()), "reason": reason})),
            )
            .await?;
            print_json(&state)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
