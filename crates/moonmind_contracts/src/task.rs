//! Canonical Task Payload Contract (spec §4.3).
//!
//! Grounded on `original_source/moonmind/workflows/agent_queue/task_contract.py`: the
//! normalization order, legacy-lift rules, and vault:// URI character classes below
//! mirror that module function-for-function, re-expressed as a validate-while-building
//! pass over `serde_json::Value` rather than a schema-library model tree (spec §9
//! design notes: "model each payload as a tagged variant ... normalizing into a shared
//! `CanonicalTaskView` struct").

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use moonmind_core::error::{Error, Result};
use moonmind_core::{normalize_capabilities, STAGE_EXECUTE, STAGE_PREPARE, STAGE_PUBLISH};

pub const CANONICAL_TASK_JOB_TYPE: &str = "task";
pub const LEGACY_TASK_JOB_TYPES: [&str; 2] = ["codex_exec", "codex_skill"];
pub const DEFAULT_TASK_RUNTIME: &str = "codex";

const SUPPORTED_RUNTIME_MODES: [&str; 4] = ["codex", "gemini", "claude", "universal"];
const SUPPORTED_PUBLISH_MODES: [&str; 3] = ["none", "branch", "pr"];
const CONTAINER_RESERVED_ENV_KEYS: [&str; 3] = ["ARTIFACT_DIR", "JOB_ID", "REPOSITORY"];
const STEP_FORBIDDEN_KEYS: [&str; 9] = [
    "runtime",
    "targetRuntime",
    "target_runtime",
    "model",
    "effort",
    "repository",
    "repo",
    "git",
    "publish",
    "container",
];

fn secret_ref_mount_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap())
}

fn secret_ref_path_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._/-]+$").unwrap())
}

fn container_volume_name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap())
}

fn clean_str(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string().trim().to_string(),
    }
}

fn clean_optional(value: Option<&Value>) -> Option<String> {
    let cleaned = clean_str(value);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn as_obj(value: &Value) -> Option<&Map<String, Value>> {
    value.as_object()
}

fn obj_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    as_obj(value).and_then(|m| m.get(key))
}

fn normalize_runtime_value(value: Option<&Value>, field_name: &str) -> Result<Option<String>> {
    let candidate = match clean_optional(value) {
        Some(c) => c,
        None => return Ok(None),
    };
    let lowered = candidate.to_lowercase();
    if !SUPPORTED_RUNTIME_MODES.contains(&lowered.as_str()) {
        return Err(Error::contract(format!(
            "{field_name} must be one of: claude, codex, gemini, universal"
        )));
    }
    Ok(Some(lowered))
}

fn normalize_publish_mode(value: Option<&Value>, default_mode: &str) -> Result<String> {
    let candidate = clean_optional(value).unwrap_or_else(|| default_mode.to_string());
    let lowered = candidate.to_lowercase();
    if !SUPPORTED_PUBLISH_MODES.contains(&lowered.as_str()) {
        return Err(Error::contract(
            "publish.mode must be one of: branch, none, pr".to_string(),
        ));
    }
    Ok(lowered)
}

fn normalize_capability_list(value: Option<&Value>, field_name: &str) -> Result<Option<Vec<String>>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let strings: Vec<String> = items.iter().map(|v| clean_str(Some(v))).collect();
            let normalized = normalize_capabilities(strings);
            Ok(if normalized.is_empty() {
                None
            } else {
                Some(normalized)
            })
        }
        Some(_) => Err(Error::contract(format!("{field_name} must be a list"))),
    }
}

/// `vault://<mount>/<path>#<field>` only — Phase-5 hardening so queue payloads never
/// carry raw credentials (spec §4.3 auth rule).
fn normalize_secret_ref(value: Option<&Value>, field_name: &str) -> Result<Option<String>> {
    let candidate = match clean_optional(value) {
        Some(c) => c,
        None => return Ok(None),
    };
    if candidate.len() > 512 {
        return Err(Error::contract(format!("{field_name} exceeds max length")));
    }
    let (scheme, rest) = candidate
        .split_once("://")
        .ok_or_else(|| Error::contract(format!("{field_name} must use vault:// secret references")))?;
    if scheme.to_lowercase() != "vault" {
        return Err(Error::contract(format!(
            "{field_name} must use vault:// secret references"
        )));
    }
    let (authority_and_path, field) = rest
        .split_once('#')
        .ok_or_else(|| invalid_vault_ref(field_name))?;
    let (mount, path) = authority_and_path
        .split_once('/')
        .ok_or_else(|| invalid_vault_ref(field_name))?;
    let mount = mount.trim();
    let path = path.trim_start_matches('/').trim();
    let field = field.trim();
    if mount.is_empty() || path.is_empty() || field.is_empty() {
        return Err(invalid_vault_ref(field_name));
    }
    if !secret_ref_mount_pattern().is_match(mount) {
        return Err(Error::contract(format!(
            "{field_name} mount contains invalid characters"
        )));
    }
    if !secret_ref_path_pattern().is_match(path) {
        return Err(Error::contract(format!(
            "{field_name} path contains invalid characters"
        )));
    }
    if path.split('/').any(|seg| seg == ".." || seg == ".") {
        return Err(Error::contract(format!(
            "{field_name} path traversal is not allowed"
        )));
    }
    if !secret_ref_mount_pattern().is_match(field) {
        return Err(Error::contract(format!(
            "{field_name} field contains invalid characters"
        )));
    }
    Ok(Some(format!("vault://{mount}/{path}#{field}")))
}

fn invalid_vault_ref(field_name: &str) -> Error {
    Error::contract(format!(
        "{field_name} must include mount/path and #field (vault://<mount>/<path>#<field>)"
    ))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskSkill {
    #[serde(default = "default_skill_id")]
    pub id: String,
    #[serde(default)]
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_capabilities: Option<Vec<String>>,
}

fn default_skill_id() -> String {
    "auto".to_string()
}

impl Default for TaskSkill {
    fn default() -> Self {
        Self {
            id: default_skill_id(),
            args: Value::Object(Map::new()),
            required_capabilities: None,
        }
    }
}

fn parse_skill(value: Option<&Value>) -> Result<TaskSkill> {
    let empty = Value::Object(Map::new());
    let value = value.unwrap_or(&empty);
    let id = clean_optional(obj_get(value, "id")).unwrap_or_else(default_skill_id);
    let args = obj_get(value, "args").cloned().unwrap_or(Value::Object(Map::new()));
    let required_capabilities =
        normalize_capability_list(obj_get(value, "requiredCapabilities"), "task.skill.requiredCapabilities")?;
    Ok(TaskSkill {
        id,
        args,
        required_capabilities,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskRuntime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
}

fn parse_runtime(value: Option<&Value>) -> Result<TaskRuntime> {
    let empty = Value::Object(Map::new());
    let value = value.unwrap_or(&empty);
    let mode_source = obj_get(value, "mode")
        .or_else(|| obj_get(value, "targetRuntime"))
        .or_else(|| obj_get(value, "target_runtime"));
    let mode = normalize_runtime_value(mode_source, "task.runtime.mode")?;
    Ok(TaskRuntime {
        mode,
        model: clean_optional(obj_get(value, "model")),
        effort: clean_optional(obj_get(value, "effort")),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskGit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starting_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_branch: Option<String>,
}

fn parse_git(value: Option<&Value>) -> TaskGit {
    let empty = Value::Object(Map::new());
    let value = value.unwrap_or(&empty);
    TaskGit {
        starting_branch: clean_optional(obj_get(value, "startingBranch")),
        new_branch: clean_optional(obj_get(value, "newBranch")),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskPublish {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_base_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_body: Option<String>,
}

fn parse_publish(value: Option<&Value>, default_mode: &str) -> Result<TaskPublish> {
    let empty = Value::Object(Map::new());
    let value = value.unwrap_or(&empty);
    let mode = normalize_publish_mode(obj_get(value, "mode"), default_mode)?;
    let pr_base_branch = clean_optional(obj_get(value, "prBaseBranch"))
        .or_else(|| clean_optional(obj_get(value, "baseBranch")));
    Ok(TaskPublish {
        mode,
        pr_base_branch,
        commit_message: clean_optional(obj_get(value, "commitMessage")),
        pr_title: clean_optional(obj_get(value, "prTitle")),
        pr_body: clean_optional(obj_get(value, "prBody")),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_auth_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_auth_ref: Option<String>,
}

fn parse_auth(value: Option<&Value>) -> Result<Option<TaskAuth>> {
    let value = match value {
        Some(v) if v.is_object() => v,
        _ => return Ok(None),
    };
    Ok(Some(TaskAuth {
        repo_auth_ref: normalize_secret_ref(obj_get(value, "repoAuthRef"), "auth.repoAuthRef")?,
        publish_auth_ref: normalize_secret_ref(
            obj_get(value, "publishAuthRef"),
            "auth.publishAuthRef",
        )?,
    }))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskCacheVolume {
    pub name: String,
    pub target: String,
}

fn parse_cache_volume(value: &Value) -> Result<TaskCacheVolume> {
    let name = clean_optional(obj_get(value, "name"))
        .ok_or_else(|| Error::contract("task.container.cacheVolumes[].name is required"))?;
    if name.contains(',') || name.contains('=') {
        return Err(Error::contract(
            "task.container.cacheVolumes[].name contains invalid characters",
        ));
    }
    if !container_volume_name_pattern().is_match(&name) {
        return Err(Error::contract(
            "task.container.cacheVolumes[].name has invalid format",
        ));
    }
    let target = clean_optional(obj_get(value, "target"))
        .ok_or_else(|| Error::contract("task.container.cacheVolumes[].target is required"))?;
    if target.contains(',') {
        return Err(Error::contract(
            "task.container.cacheVolumes[].target may not contain ','",
        ));
    }
    if !target.starts_with('/') {
        return Err(Error::contract(
            "task.container.cacheVolumes[].target must be an absolute path",
        ));
    }
    Ok(TaskCacheVolume { name, target })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskContainer {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts_subdir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_volumes: Option<Vec<TaskCacheVolume>>,
}

fn parse_bool_ish(value: Option<&Value>) -> Result<bool> {
    match value {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => {
            let candidate = clean_str(Some(other)).to_lowercase();
            if candidate.is_empty() {
                return Ok(false);
            }
            match candidate.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(Error::contract("task.container.enabled must be a boolean")),
            }
        }
    }
}

fn parse_container(value: Option<&Value>) -> Result<Option<TaskContainer>> {
    let value = match value {
        Some(v) if !v.is_null() => v,
        _ => return Ok(None),
    };
    let enabled = parse_bool_ish(obj_get(value, "enabled"))?;
    let image = clean_optional(obj_get(value, "image"));
    let command = match obj_get(value, "command") {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => {
            let out: Vec<String> = items.iter().filter_map(|v| clean_optional(Some(v))).collect();
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        }
        Some(_) => return Err(Error::contract("task.container.command must be a list")),
    };
    let env = match obj_get(value, "env") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => {
            let mut out = BTreeMap::new();
            for (key, val) in map {
                let key = key.trim();
                if key.is_empty() {
                    continue;
                }
                if key.contains('=') {
                    return Err(Error::contract(
                        "task.container.env keys may not contain '='",
                    ));
                }
                if CONTAINER_RESERVED_ENV_KEYS.contains(&key.to_uppercase().as_str()) {
                    return Err(Error::contract(format!(
                        "task.container.env may not override reserved key '{key}'"
                    )));
                }
                out.insert(key.to_string(), clean_str(Some(val)));
            }
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        }
        Some(_) => return Err(Error::contract("task.container.env must be an object")),
    };
    let timeout_seconds = match obj_get(value, "timeoutSeconds") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => {
            let t = n
                .as_i64()
                .ok_or_else(|| Error::contract("task.container.timeoutSeconds must be an integer"))?;
            if t < 1 {
                return Err(Error::contract(
                    "task.container.timeoutSeconds must be greater than zero",
                ));
            }
            Some(t)
        }
        Some(_) => {
            return Err(Error::contract(
                "task.container.timeoutSeconds must be an integer",
            ))
        }
    };
    let pull = match clean_optional(obj_get(value, "pull")) {
        None => None,
        Some(raw) => {
            let lowered = raw.to_lowercase();
            if lowered != "if-missing" && lowered != "always" {
                return Err(Error::contract(
                    "task.container.pull must be if-missing or always",
                ));
            }
            Some(lowered)
        }
    };
    let cache_volumes = match obj_get(value, "cacheVolumes") {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(parse_cache_volume(item)?);
            }
            Some(out)
        }
        Some(_) => return Err(Error::contract("task.container.cacheVolumes must be a list")),
    };
    let container = TaskContainer {
        enabled,
        image,
        command,
        workdir: clean_optional(obj_get(value, "workdir")),
        env,
        artifacts_subdir: clean_optional(obj_get(value, "artifactsSubdir")),
        timeout_seconds,
        pull,
        resources: obj_get(value, "resources").cloned(),
        cache_volumes,
    };
    if container.enabled {
        if container.image.is_none() {
            return Err(Error::contract(
                "task.container.image is required when task.container.enabled=true",
            ));
        }
        if container.command.is_none() {
            return Err(Error::contract(
                "task.container.command is required when task.container.enabled=true",
            ));
        }
    }
    Ok(Some(container))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill: Option<TaskSkill>,
}

fn parse_step(value: &Value) -> Result<TaskStep> {
    if let Some(map) = as_obj(value) {
        let blocked: Vec<&str> = STEP_FORBIDDEN_KEYS
            .iter()
            .filter(|k| map.contains_key(**k))
            .copied()
            .collect();
        if !blocked.is_empty() {
            return Err(Error::contract(format!(
                "task.steps entries may not define task-scoped overrides: {}",
                blocked.join(", ")
            )));
        }
    }
    let skill = match obj_get(value, "skill") {
        None | Some(Value::Null) => None,
        Some(v) => Some(parse_skill(Some(v))?),
    };
    Ok(TaskStep {
        id: clean_optional(obj_get(value, "id")),
        title: clean_optional(obj_get(value, "title")),
        instructions: clean_optional(obj_get(value, "instructions")),
        skill,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskBody {
    pub instructions: String,
    pub skill: TaskSkill,
    pub runtime: TaskRuntime,
    pub git: TaskGit,
    pub publish: TaskPublish,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<TaskStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<TaskContainer>,
}

fn lift_legacy_task_runtime_shape(value: &Value) -> Value {
    let map = match as_obj(value) {
        Some(m) => m.clone(),
        None => return value.clone(),
    };
    let mut out = map;
    let runtime_node = out.get("runtime").cloned();
    match runtime_node {
        Some(Value::String(mode)) => {
            let mut runtime = Map::new();
            runtime.insert("mode".to_string(), Value::String(mode));
            out.insert("runtime".to_string(), Value::Object(runtime));
        }
        None => {
            let legacy = out
                .get("targetRuntime")
                .or_else(|| out.get("target_runtime"))
                .cloned();
            if let Some(Value::String(s)) = legacy {
                if !s.trim().is_empty() {
                    let mut runtime = Map::new();
                    runtime.insert("mode".to_string(), Value::String(s));
                    out.insert("runtime".to_string(), Value::Object(runtime));
                }
            }
        }
        _ => {}
    }
    Value::Object(out)
}

fn parse_task_body(value: &Value, default_publish_mode: &str) -> Result<TaskBody> {
    let lifted = lift_legacy_task_runtime_shape(value);
    let instructions = clean_optional(obj_get(&lifted, "instructions"))
        .or_else(|| clean_optional(obj_get(&lifted, "instruction")))
        .ok_or_else(|| Error::contract("task.instructions is required"))?;
    let skill = parse_skill(obj_get(&lifted, "skill"))?;
    let runtime = parse_runtime(obj_get(&lifted, "runtime"))?;
    let git = parse_git(obj_get(&lifted, "git"));
    let publish = parse_publish(obj_get(&lifted, "publish"), default_publish_mode)?;
    let steps = match obj_get(&lifted, "steps") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(parse_step(item)?);
            }
            out
        }
        Some(_) => return Err(Error::contract("task.steps must be a list")),
    };
    let container = parse_container(obj_get(&lifted, "container"))?;
    if let Some(c) = &container {
        if c.enabled && !steps.is_empty() {
            return Err(Error::contract(
                "task.steps is not supported when task.container.enabled=true",
            ));
        }
    }
    Ok(TaskBody {
        instructions,
        skill,
        runtime,
        git,
        publish,
        steps,
        container,
    })
}

/// The normalized, canonical view of a `type=task` queue job payload (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalTaskView {
    pub repository: String,
    pub target_runtime: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<TaskAuth>,
    pub task: TaskBody,
}

impl CanonicalTaskView {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("CanonicalTaskView always serializes")
    }
}

fn lift_legacy_top_level_shape(source: &Value, default_publish_mode: &str) -> Result<Value> {
    let map = match as_obj(source) {
        Some(m) => m.clone(),
        None => return Ok(source.clone()),
    };
    let mut out = map;
    let has_task_object = matches!(out.get("task"), Some(Value::Object(_)));
    if !has_task_object {
        let legacy_instruction = clean_optional(out.get("instructions"))
            .or_else(|| clean_optional(out.get("instruction")))
            .unwrap_or_default();
        let mode = out
            .get("targetRuntime")
            .or_else(|| out.get("target_runtime"))
            .or_else(|| out.get("runtime"))
            .cloned();
        let mut runtime = Map::new();
        if let Some(m) = mode {
            runtime.insert("mode".to_string(), m);
        }
        let mut task = Map::new();
        task.insert("instructions".to_string(), Value::String(legacy_instruction));
        task.insert("runtime".to_string(), Value::Object(runtime));
        out.insert("task".to_string(), Value::Object(task));
    } else if let Some(Value::Object(task_node)) = out.get("task").cloned() {
        let mut task_node = task_node;
        let has_instructions = clean_optional(task_node.get("instructions")).is_some();
        if !has_instructions {
            let lifted = clean_optional(out.get("instructions"))
                .or_else(|| clean_optional(out.get("instruction")));
            if let Some(text) = lifted {
                task_node.insert("instructions".to_string(), Value::String(text));
            }
        }
        out.insert("task".to_string(), Value::Object(task_node));
    }
    let _ = default_publish_mode;
    Ok(Value::Object(out))
}

fn parse_canonical_payload(source: &Value, default_publish_mode: &str) -> Result<CanonicalTaskView> {
    let lifted = lift_legacy_top_level_shape(source, default_publish_mode)?;
    let repository = clean_optional(obj_get(&lifted, "repository"))
        .or_else(|| clean_optional(obj_get(&lifted, "repo")))
        .ok_or_else(|| Error::contract("repository is required"))?;
    let target_runtime = normalize_runtime_value(
        obj_get(&lifted, "targetRuntime").or_else(|| obj_get(&lifted, "target_runtime")),
        "targetRuntime",
    )?;
    let required_capabilities =
        normalize_capability_list(obj_get(&lifted, "requiredCapabilities"), "requiredCapabilities")?
            .unwrap_or_default();
    let auth = parse_auth(obj_get(&lifted, "auth"))?;
    let task_node = obj_get(&lifted, "task")
        .ok_or_else(|| Error::contract("task is required"))?;
    let task = parse_task_body(task_node, default_publish_mode)?;
    Ok(CanonicalTaskView {
        repository,
        target_runtime: target_runtime.unwrap_or_else(|| DEFAULT_TASK_RUNTIME.to_string()),
        required_capabilities,
        auth,
        task,
    })
}

fn build_task_from_codex_exec_payload(source: &Value, default_publish_mode: &str) -> Result<TaskBody> {
    let publish = obj_get(source, "publish").cloned().unwrap_or(Value::Object(Map::new()));
    let codex = obj_get(source, "codex").cloned().unwrap_or(Value::Object(Map::new()));
    let instructions = clean_optional(obj_get(source, "instruction"))
        .unwrap_or_else(|| "Legacy codex_exec job".to_string());
    let publish_mode_raw = obj_get(&publish, "mode")
        .cloned()
        .unwrap_or_else(|| Value::String("none".to_string()));
    Ok(TaskBody {
        instructions,
        skill: TaskSkill::default(),
        runtime: TaskRuntime {
            mode: Some("codex".to_string()),
            model: clean_optional(obj_get(&codex, "model")),
            effort: clean_optional(obj_get(&codex, "effort")),
        },
        git: TaskGit {
            starting_branch: clean_optional(obj_get(source, "ref")),
            new_branch: None,
        },
        publish: TaskPublish {
            mode: normalize_publish_mode(Some(&publish_mode_raw), default_publish_mode)?,
            pr_base_branch: clean_optional(obj_get(&publish, "prBaseBranch"))
                .or_else(|| clean_optional(obj_get(&publish, "baseBranch"))),
            commit_message: None,
            pr_title: None,
            pr_body: None,
        },
        steps: Vec::new(),
        container: None,
    })
}

fn build_task_from_codex_skill_payload(source: &Value, default_publish_mode: &str) -> Result<TaskBody> {
    let inputs = obj_get(source, "inputs").cloned().unwrap_or(Value::Object(Map::new()));
    let codex = obj_get(source, "codex").cloned().unwrap_or(Value::Object(Map::new()));
    let input_codex = obj_get(&inputs, "codex").cloned().unwrap_or(Value::Object(Map::new()));

    let skill_id = clean_optional(obj_get(source, "skillId")).unwrap_or_else(|| "speckit".to_string());
    let repository = clean_optional(obj_get(&inputs, "repo"))
        .or_else(|| clean_optional(obj_get(&inputs, "repository")))
        .or_else(|| clean_optional(obj_get(source, "repository")));
    let instruction = clean_optional(obj_get(&inputs, "instruction"))
        .or_else(|| clean_optional(obj_get(source, "instruction")))
        .unwrap_or_else(|| {
            format!(
                "Execute skill '{skill_id}' with inputs:\n{}",
                serde_json::to_string_pretty(&inputs).unwrap_or_default()
            )
        });
    let publish_mode = clean_optional(obj_get(&inputs, "publishMode"))
        .or_else(|| clean_optional(obj_get(source, "publishMode")))
        .unwrap_or_else(|| "none".to_string());
    let publish_base = clean_optional(obj_get(&inputs, "publishBaseBranch"))
        .or_else(|| clean_optional(obj_get(source, "publishBaseBranch")));
    let starting_branch =
        clean_optional(obj_get(&inputs, "ref")).or_else(|| clean_optional(obj_get(source, "ref")));

    let mut args = as_obj(&inputs).cloned().unwrap_or_default();
    if let Some(repo) = &repository {
        args.entry("repo".to_string())
            .or_insert_with(|| Value::String(repo.clone()));
    }

    Ok(TaskBody {
        instructions: instruction,
        skill: TaskSkill {
            id: skill_id,
            args: Value::Object(args),
            required_capabilities: None,
        },
        runtime: TaskRuntime {
            mode: Some("codex".to_string()),
            model: clean_optional(obj_get(&codex, "model")).or_else(|| clean_optional(obj_get(&input_codex, "model"))),
            effort: clean_optional(obj_get(&codex, "effort"))
                .or_else(|| clean_optional(obj_get(&input_codex, "effort"))),
        },
        git: TaskGit {
            starting_branch,
            new_branch: None,
        },
        publish: TaskPublish {
            mode: normalize_publish_mode(Some(&Value::String(publish_mode)), default_publish_mode)?,
            pr_base_branch: publish_base,
            commit_message: None,
            pr_title: None,
            pr_body: None,
        },
        steps: Vec::new(),
        container: None,
    })
}

/// Build the canonical task view for any job type: `task` is parsed/validated
/// directly, `codex_exec`/`codex_skill` are lifted, anything else gets a minimal
/// passthrough canonical shell (spec §4.3).
pub fn build_canonical_task_view(
    job_type: &str,
    payload: Option<&Value>,
    default_runtime: &str,
    default_publish_mode: &str,
) -> Result<CanonicalTaskView> {
    let empty = Value::Object(Map::new());
    let source = payload.unwrap_or(&empty);
    let resolved_default_runtime = {
        let normalized = normalize_runtime_value(Some(&Value::String(default_runtime.to_string())), "default runtime")?;
        match normalized.as_deref() {
            None | Some("universal") => DEFAULT_TASK_RUNTIME.to_string(),
            Some(other) => other.to_string(),
        }
    };

    let mut canonical = if job_type == CANONICAL_TASK_JOB_TYPE {
        parse_canonical_payload(source, default_publish_mode)?
    } else if job_type == "codex_exec" {
        let repository = clean_optional(obj_get(source, "repository"))
            .ok_or_else(|| Error::contract("repository is required"))?;
        CanonicalTaskView {
            repository,
            target_runtime: "codex".to_string(),
            required_capabilities: Vec::new(),
            auth: parse_auth(obj_get(source, "auth"))?,
            task: build_task_from_codex_exec_payload(source, default_publish_mode)?,
        }
    } else if job_type == "codex_skill" {
        let inputs = obj_get(source, "inputs");
        let repository = clean_optional(obj_get(source, "repository"))
            .or_else(|| inputs.and_then(|i| clean_optional(obj_get(i, "repo"))))
            .or_else(|| inputs.and_then(|i| clean_optional(obj_get(i, "repository"))))
            .ok_or_else(|| Error::contract("repository is required"))?;
        CanonicalTaskView {
            repository,
            target_runtime: "codex".to_string(),
            required_capabilities: Vec::new(),
            auth: parse_auth(obj_get(source, "auth"))?,
            task: build_task_from_codex_skill_payload(source, default_publish_mode)?,
        }
    } else {
        CanonicalTaskView {
            repository: clean_optional(obj_get(source, "repository")).unwrap_or_default(),
            target_runtime: resolved_default_runtime.clone(),
            required_capabilities: Vec::new(),
            auth: parse_auth(obj_get(source, "auth"))?,
            task: TaskBody {
                instructions: clean_optional(obj_get(source, "instruction")).unwrap_or_else(|| "Queue job".to_string()),
                skill: TaskSkill::default(),
                runtime: TaskRuntime {
                    mode: Some(resolved_default_runtime.clone()),
                    model: None,
                    effort: None,
                },
                git: TaskGit::default(),
                publish: TaskPublish {
                    mode: "none".to_string(),
                    pr_base_branch: None,
                    commit_message: None,
                    pr_title: None,
                    pr_body: None,
                },
                steps: Vec::new(),
                container: None,
            },
        }
    };

    let mut target_runtime = canonical
        .task
        .runtime
        .mode
        .clone()
        .filter(|m| m != "universal")
        .unwrap_or_else(|| canonical.target_runtime.clone());
    if target_runtime == "universal" || target_runtime.is_empty() {
        target_runtime = resolved_default_runtime;
    }
    canonical.task.runtime.mode = Some(target_runtime.clone());
    canonical.target_runtime = target_runtime.clone();

    // Derive requiredCapabilities, ordered and deduplicated (spec §4.3).
    let mut required: Vec<String> = source
        .get("requiredCapabilities")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().map(|v| clean_str(Some(v))).collect())
        .unwrap_or_default();
    required.extend(canonical.required_capabilities.iter().cloned());
    required.push(target_runtime);
    required.push("git".to_string());
    if canonical.task.publish.mode == "pr" {
        required.push("gh".to_string());
    }
    if let Some(caps) = &canonical.task.skill.required_capabilities {
        required.extend(caps.iter().cloned());
    }
    for step in &canonical.task.steps {
        if let Some(skill) = &step.skill {
            if let Some(caps) = &skill.required_capabilities {
                required.extend(caps.iter().cloned());
            }
        }
    }
    if let Some(container) = &canonical.task.container {
        if container.enabled {
            required.push("docker".to_string());
        }
    }
    canonical.required_capabilities = normalize_capabilities(required);

    Ok(canonical)
}

/// Normalize a queue job payload for persistence, preserving unknown legacy fields for
/// non-canonical job types (spec §4.3 "Legacy payloads").
pub fn normalize_queue_job_payload(
    job_type: &str,
    payload: Option<&Value>,
    default_runtime: &str,
    default_publish_mode: &str,
) -> Result<Value> {
    let canonical = build_canonical_task_view(job_type, payload, default_runtime, default_publish_mode)?;

    if job_type == CANONICAL_TASK_JOB_TYPE {
        return Ok(canonical.to_json());
    }

    if LEGACY_TASK_JOB_TYPES.contains(&job_type) {
        let empty = Value::Object(Map::new());
        let mut source = as_obj(payload.unwrap_or(&empty)).cloned().unwrap_or_default();
        source.insert("repository".to_string(), Value::String(canonical.repository.clone()));
        source.insert(
            "targetRuntime".to_string(),
            Value::String(canonical.target_runtime.clone()),
        );
        source.insert(
            "auth".to_string(),
            canonical
                .auth
                .as_ref()
                .map(|a| serde_json::to_value(a).unwrap())
                .unwrap_or(Value::Null),
        );
        source.insert(
            "requiredCapabilities".to_string(),
            serde_json::to_value(&canonical.required_capabilities).unwrap(),
        );
        source.insert("task".to_string(), serde_json::to_value(&canonical.task).unwrap());
        return Ok(Value::Object(source));
    }

    let empty = Value::Object(Map::new());
    let mut source = as_obj(payload.unwrap_or(&empty)).cloned().unwrap_or_default();
    if let Some(Value::Array(_)) = source.get("requiredCapabilities") {
        let normalized = normalize_capability_list(source.get("requiredCapabilities"), "requiredCapabilities")?
            .unwrap_or_default();
        source.insert(
            "requiredCapabilities".to_string(),
            serde_json::to_value(normalized).unwrap(),
        );
    }
    Ok(Value::Object(source))
}

/// Ordered stage markers a worker emits as events (spec §4.3, glossary).
pub fn build_task_stage_plan(canonical: &CanonicalTaskView) -> Vec<String> {
    let mut stages = vec![STAGE_PREPARE.to_string(), STAGE_EXECUTE.to_string()];
    if canonical.task.publish.mode != "none" {
        stages.push(STAGE_PUBLISH.to_string());
    }
    stages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(job_type: &str, payload: Value) -> CanonicalTaskView {
        build_canonical_task_view(job_type, Some(&payload), "codex", "pr").unwrap()
    }

    #[test]
    fn canonical_task_derives_capabilities_in_order() {
        let payload = serde_json::json!({
            "repository": "Moon/Mind",
            "task": {"instructions": "do the thing", "publish": {"mode": "pr"}}
        });
        let canonical = view(CANONICAL_TASK_JOB_TYPE, payload);
        assert_eq!(
            canonical.required_capabilities,
            vec!["codex".to_string(), "git".to_string(), "gh".to_string()]
        );
    }

    #[test]
    fn universal_runtime_rewritten_to_default() {
        let payload = serde_json::json!({
            "repository": "Moon/Mind",
            "targetRuntime": "universal",
            "task": {"instructions": "do it"}
        });
        let canonical = view(CANONICAL_TASK_JOB_TYPE, payload);
        assert_eq!(canonical.target_runtime, "codex");
    }

    #[test]
    fn container_and_steps_are_mutually_exclusive() {
        let payload = serde_json::json!({
            "repository": "Moon/Mind",
            "task": {
                "instructions": "do it",
                "steps": [{"instructions": "a step"}],
                "container": {"enabled": true, "image": "x", "command": ["run"]}
            }
        });
        let err = build_canonical_task_view(CANONICAL_TASK_JOB_TYPE, Some(&payload), "codex", "pr").unwrap_err();
        assert!(matches!(err, Error::Contract { .. }));
    }

    #[test]
    fn step_may_not_override_task_scoped_keys() {
        let payload = serde_json::json!({
            "repository": "Moon/Mind",
            "task": {
                "instructions": "do it",
                "steps": [{"instructions": "a step", "runtime": "claude"}]
            }
        });
        let err = build_canonical_task_view(CANONICAL_TASK_JOB_TYPE, Some(&payload), "codex", "pr").unwrap_err();
        assert!(matches!(err, Error::Contract { .. }));
    }

    #[test]
    fn auth_refs_require_vault_scheme() {
        let payload = serde_json::json!({
            "repository": "Moon/Mind",
            "auth": {"repoAuthRef": "raw-token-not-a-uri"},
            "task": {"instructions": "do it"}
        });
        let err = build_canonical_task_view(CANONICAL_TASK_JOB_TYPE, Some(&payload), "codex", "pr").unwrap_err();
        assert!(matches!(err, Error::Contract { .. }));
    }

    #[test]
    fn auth_ref_round_trips_when_valid() {
        let payload = serde_json::json!({
            "repository": "Moon/Mind",
            "auth": {"repoAuthRef": "vault://secret/data/moonmind#token"},
            "task": {"instructions": "do it"}
        });
        let canonical = view(CANONICAL_TASK_JOB_TYPE, payload);
        assert_eq!(
            canonical.auth.unwrap().repo_auth_ref.unwrap(),
            "vault://secret/data/moonmind#token"
        );
    }

    #[test]
    fn codex_exec_legacy_lift_produces_canonical_shape() {
        let payload = serde_json::json!({
            "instruction": "fix the bug",
            "repository": "Moon/Mind",
            "ref": "main",
            "publish": {"mode": "branch"}
        });
        let canonical = view("codex_exec", payload);
        assert_eq!(canonical.task.instructions, "fix the bug");
        assert_eq!(canonical.task.git.starting_branch.as_deref(), Some("main"));
        assert_eq!(canonical.task.publish.mode, "branch");
    }

    #[test]
    fn codex_skill_pulls_repository_from_inputs() {
        let payload = serde_json::json!({
            "skillId": "my-skill",
            "inputs": {"repo": "Moon/Mind", "instruction": "run the skill"}
        });
        let canonical = view("codex_skill", payload);
        assert_eq!(canonical.repository, "Moon/Mind");
        assert_eq!(canonical.task.skill.id, "my-skill");
    }

    #[test]
    fn stage_plan_includes_publish_when_not_none() {
        let payload = serde_json::json!({
            "repository": "Moon/Mind",
            "task": {"instructions": "do it", "publish": {"mode": "pr"}}
        });
        let canonical = view(CANONICAL_TASK_JOB_TYPE, payload);
        assert_eq!(
            build_task_stage_plan(&canonical),
            vec![STAGE_PREPARE.to_string(), STAGE_EXECUTE.to_string(), STAGE_PUBLISH.to_string()]
        );
    }

    #[test]
    fn stage_plan_excludes_publish_when_none() {
        let payload = serde_json::json!({
            "repository": "Moon/Mind",
            "task": {"instructions": "do it", "publish": {"mode": "none"}}
        });
        let canonical = view(CANONICAL_TASK_JOB_TYPE, payload);
        assert_eq!(
            build_task_stage_plan(&canonical),
            vec![STAGE_PREPARE.to_string(), STAGE_EXECUTE.to_string()]
        );
    }
}
