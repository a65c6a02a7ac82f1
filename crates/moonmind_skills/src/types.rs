//! Resolved/materialized skill types shared by the resolver and materializer
//! (spec §4.9).

use std::path::PathBuf;

use serde::Serialize;

/// Resolved runtime metadata for one selected skill, before it has been fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSkill {
    pub skill_name: String,
    pub version: String,
    pub source_uri: String,
    pub content_hash: Option<String>,
    pub signature: Option<String>,
}

/// Effective per-run skill selection used by the materializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSkillSelection {
    pub run_id: String,
    pub selection_source: SelectionSource,
    pub skills: Vec<ResolvedSkill>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    JobOverride,
    QueueProfile,
    GlobalDefault,
}

impl SelectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobOverride => "job_override",
            Self::QueueProfile => "queue_profile",
            Self::GlobalDefault => "global_default",
        }
    }
}

impl RunSkillSelection {
    /// A serializable summary for logs and context metadata.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "selectionSource": self.selection_source.as_str(),
            "skills": self.skills.iter().map(|skill| {
                serde_json::json!({
                    "name": skill.skill_name,
                    "version": skill.version,
                    "sourceUri": skill.source_uri,
                    "contentHash": skill.content_hash,
                    "signature": skill.signature,
                })
            }).collect::<Vec<_>>(),
        })
    }
}

/// Materialized skill metadata for one run: a cache-root directory this run's
/// `skills_active/{name}` symlink points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedSkill {
    pub name: String,
    pub version: String,
    pub source_uri: String,
    pub content_hash: String,
    pub cache_path: PathBuf,
}

/// Resolved adapter link paths for one run workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillWorkspaceLinks {
    pub skills_active_path: PathBuf,
    pub agents_skills_path: PathBuf,
    pub gemini_skills_path: PathBuf,
}

impl SkillWorkspaceLinks {
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "skillsActivePath": self.skills_active_path.display().to_string(),
            "agentsSkillsPath": self.agents_skills_path.display().to_string(),
            "geminiSkillsPath": self.gemini_skills_path.display().to_string(),
        })
    }
}

/// Resolved shared skill workspace for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedSkillWorkspace {
    pub run_id: String,
    pub selection_source: SelectionSource,
    pub run_root: PathBuf,
    pub cache_root: PathBuf,
    pub links: SkillWorkspaceLinks,
    pub skills: Vec<MaterializedSkill>,
}

impl MaterializedSkillWorkspace {
    pub fn to_payload(&self) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "runId": self.run_id,
            "selectionSource": self.selection_source.as_str(),
            "skills": self.skills.iter().map(|skill| {
                serde_json::json!({
                    "name": skill.name,
                    "version": skill.version,
                    "sourceUri": skill.source_uri,
                    "contentHash": skill.content_hash,
                    "cachePath": skill.cache_path.display().to_string(),
                })
            }).collect::<Vec<_>>(),
        });
        let links = self.links.to_payload();
        payload
            .as_object_mut()
            .expect("object literal")
            .extend(links.as_object().expect("object literal").clone());
        payload
    }
}
