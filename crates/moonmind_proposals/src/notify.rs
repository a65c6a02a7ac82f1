//! Best-effort review-queue webhook notifications (spec §4.7 "Notifications").
//!
//! Grounded on `service.py`'s `_emit_notification`/`_build_notification_payload`: post
//! once per proposal for categories `{security, tests}`, log success/failure, never let
//! a failed delivery affect the caller's result.

use moonmind_core::error::Result;
use moonmind_core::proposal::TaskProposal;
use moonmind_db::Repository;
use serde_json::{json, Value};

pub const NOTIFICATION_CATEGORIES: [&str; 2] = ["security", "tests"];

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub authorization: Option<String>,
    pub timeout_seconds: u64,
    pub enabled: bool,
}

pub fn should_notify_category(category: &str) -> bool {
    let lowered = category.trim().to_lowercase();
    NOTIFICATION_CATEGORIES.contains(&lowered.as_str())
}

/// Chat-style payload (title/fields/attachments) a reviewer-facing webhook consumer
/// can render directly.
pub fn build_notification_payload(proposal: &TaskProposal) -> Value {
    let summary_preview: String = proposal.summary.chars().take(4000).collect();
    let mut payload = json!({
        "text": format!("[Task Proposal] {} \u{2192} {}", proposal.category, proposal.repository),
        "attachments": [{
            "title": proposal.title,
            "title_link": format!("/tasks/proposals/{}", proposal.id),
            "text": summary_preview,
            "fields": [
                {"title": "Repository", "value": proposal.repository, "short": true},
                {"title": "Priority", "value": proposal.review_priority.as_str(), "short": true},
            ],
        }],
        "proposalId": proposal.id.to_string(),
        "category": proposal.category,
        "taskPreview": proposal.task_create_request,
    });
    if let Some(origin_id) = &proposal.origin_id {
        payload["originId"] = json!(origin_id);
    }
    payload
}

/// Post the notification if enabled, due (category matches), and not already sent;
/// records the outcome in the notification audit table regardless of delivery result.
/// Never returns an error for a delivery failure — only a repository failure escapes.
pub async fn emit_notification(
    client: &reqwest::Client,
    repo: &Repository,
    config: &NotifyConfig,
    proposal: &TaskProposal,
) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }
    let Some(webhook) = config.webhook_url.as_deref() else {
        return Ok(());
    };
    if !should_notify_category(&proposal.category) {
        return Ok(());
    }
    if repo.has_proposal_notification(proposal.id, webhook).await? {
        return Ok(());
    }

    let payload = build_notification_payload(proposal);
    let mut request = client
        .post(webhook)
        .timeout(std::time::Duration::from_secs(config.timeout_seconds))
        .json(&payload);
    if let Some(authorization) = &config.authorization {
        request = request.header("Authorization", authorization);
    }

    let (status, error_message) = match request.send().await {
        Ok(response) if response.status().is_success() => ("sent", None),
        Ok(response) => ("failed", Some(format!("webhook returned {}", response.status()))),
        Err(err) => {
            tracing::warn!("proposal notification failed for {}: {err}", proposal.id);
            ("failed", Some(err.to_string()))
        }
    };

    if let Err(err) = repo
        .log_proposal_notification(proposal.id, &proposal.category, webhook, status, error_message.as_deref())
        .await
    {
        tracing::debug!("notification audit insert failed for proposal {}: {err}", proposal.id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_security_and_tests_notify() {
        assert!(should_notify_category("Security"));
        assert!(should_notify_category("tests"));
        assert!(!should_notify_category("run_quality"));
        assert!(!should_notify_category(""));
    }
}
