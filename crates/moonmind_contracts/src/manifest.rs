//! Manifest Contract (spec §4.4): validation, capability derivation, and secret-leak
//! scanning for `type=manifest` queue jobs.
//!
//! Grounded on `original_source/moonmind/workflows/agent_queue/manifest_contract.py`.
//! The capability mapping tables, secret-reference grammars, and the heuristic secret
//! scanner below are carried over verbatim; only the base "manifest" capability is
//! hardcoded here rather than read from a settings object, since `moonmind_core::Config`
//! does not (yet) expose a tunable list (see DESIGN.md open-question notes).

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use moonmind_core::error::{Error, Result};

const BASE_MANIFEST_CAPABILITIES: [&str; 1] = ["manifest"];
const ALLOWED_ACTIONS: [&str; 2] = ["plan", "run"];
const ALLOWED_OPTION_KEYS: [&str; 3] = ["dryRun", "forceFull", "maxDocs"];
const SAFE_REFERENCE_PREFIXES: [&str; 2] = ["profile://", "vault://"];

const SENSITIVE_FIELD_NAMES: [&str; 10] = [
    "api_key",
    "apikey",
    "access_key",
    "client_secret",
    "secret",
    "secret_key",
    "private_key",
    "password",
    "token",
    "auth_token",
];
const SUSPECT_VALUE_PREFIXES_LOWER: [&str; 16] = [
    "sk-", "sk_live_", "sk_test_", "rk_live_", "rk_test_", "pk_live_", "pk_test_", "ghp_", "gho_",
    "ghu_", "ghs_", "ghr_", "xoxp-", "xoxb-", "xapp-", "ya29.",
];
const SUSPECT_VALUE_PREFIXES_UPPER: [&str; 4] = ["AKIA", "ASIA", "EAAC", "AIZA"];
const SUSPECT_VALUE_SUBSTRINGS: [&str; 8] = [
    "token=",
    "secret=",
    "password=",
    "api_key=",
    "apikey=",
    "client_secret=",
    "access_key=",
    "bearer ",
];

fn embedding_provider_capability(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("openai"),
        "google" => Some("google"),
        "ollama" => Some("ollama"),
        _ => None,
    }
}

fn vector_store_capability(kind: &str) -> Option<&'static str> {
    match kind {
        "qdrant" => Some("qdrant"),
        "pgvector" => Some("pgvector"),
        "milvus" => Some("milvus"),
        _ => None,
    }
}

fn data_source_capability(kind: &str) -> Option<&'static str> {
    match kind {
        "githubrepositoryreader" => Some("github"),
        "googledrivereader" => Some("gdrive"),
        "confluencereader" => Some("confluence"),
        "simpledirectoryreader" => Some("local_fs"),
        _ => None,
    }
}

fn profile_token_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap())
}

fn vault_mount_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap())
}

fn vault_path_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._/-]+$").unwrap())
}

fn jwt_segment_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+=*$").unwrap())
}

fn base64ish_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9+/=_-]+$").unwrap())
}

fn clean_str(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string().trim().to_string(),
    }
}

fn obj_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.as_object().and_then(|m| m.get(key))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSource {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub content_hash: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManifestOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_full: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_docs: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestNormalized {
    pub name: String,
    pub action: String,
    pub source: ManifestSource,
    pub options: ManifestOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSecretRef {
    pub provider: String,
    pub field: String,
    pub env_key: String,
    pub normalized: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VaultSecretRef {
    pub mount: String,
    pub path: String,
    pub field: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSecretRefs {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub profile: Vec<ProfileSecretRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vault: Vec<VaultSecretRef>,
}

impl ManifestSecretRefs {
    fn is_empty(&self) -> bool {
        self.profile.is_empty() && self.vault.is_empty()
    }
}

/// Normalized `type=manifest` queue payload (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestView {
    pub manifest: ManifestNormalized,
    pub manifest_hash: String,
    pub manifest_version: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
    pub effective_run_config: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_secret_refs: Option<ManifestSecretRefs>,
}

impl ManifestView {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("ManifestView always serializes")
    }
}

fn detect_manifest_version(manifest: &Value) -> String {
    match obj_get(manifest, "version") {
        Some(Value::String(s)) => s.trim().to_lowercase(),
        _ => "legacy".to_string(),
    }
}

fn compute_manifest_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

fn parse_manifest_yaml(content: &str) -> Result<Value> {
    let parsed: serde_yaml::Value = serde_yaml::from_str(content)
        .map_err(|_| Error::contract("manifest YAML is invalid"))?;
    let json = serde_json::to_value(parsed).map_err(|_| Error::contract("manifest YAML is invalid"))?;
    if !json.is_object() {
        return Err(Error::contract("manifest YAML must decode to an object"));
    }
    Ok(json)
}

fn normalize_source(source_node: Option<&Value>, manifest_name: &str, allow_path_source: bool) -> Result<(ManifestSource, String)> {
    let source_node = source_node
        .filter(|v| v.is_object())
        .ok_or_else(|| Error::contract("manifest.source must be an object"))?;
    let kind = clean_str(obj_get(source_node, "kind")).to_lowercase();
    if kind.is_empty() {
        return Err(Error::contract("manifest.source.kind must be provided"));
    }
    let mut allowed = vec!["inline", "registry"];
    if allow_path_source {
        allowed.push("path");
    }
    if !allowed.contains(&kind.as_str()) {
        return Err(Error::contract(format!(
            "manifest.source.kind must be one of: {}",
            {
                let mut sorted = allowed;
                sorted.sort_unstable();
                sorted.join(", ")
            }
        )));
    }

    let raw_content = obj_get(source_node, "content");
    let content = match raw_content {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => {
            if s.trim().is_empty() {
                return Err(Error::contract("manifest.source.content must not be empty"));
            }
            Some(s.clone())
        }
        Some(_) => return Err(Error::contract("manifest.source.content must be a string")),
    };
    let content = content.ok_or_else(|| Error::contract("manifest.source.content is required for normalization"))?;

    let mut name = None;
    let mut path = None;
    if kind == "registry" {
        let registry_name = clean_str(obj_get(source_node, "name"));
        let registry_name = if registry_name.is_empty() {
            manifest_name.to_string()
        } else {
            registry_name
        };
        if registry_name.is_empty() {
            return Err(Error::contract(
                "registry manifest.source.name must be provided or match manifest.name",
            ));
        }
        name = Some(registry_name);
    } else if kind == "path" {
        let path_value = clean_str(obj_get(source_node, "path"));
        if path_value.is_empty() {
            return Err(Error::contract(
                "manifest.source.path must be defined for path sources",
            ));
        }
        path = Some(path_value);
    }

    let source = ManifestSource {
        kind,
        content: Some(content.clone()),
        name,
        path,
        content_hash: String::new(),
        version: String::new(),
    };
    Ok((source, content))
}

fn normalize_options(options_node: Option<&Value>) -> Result<ManifestOptions> {
    let node = match options_node {
        None | Some(Value::Null) => return Ok(ManifestOptions::default()),
        Some(v) => v,
    };
    let map = node
        .as_object()
        .ok_or_else(|| Error::contract("manifest.options must be an object when provided"))?;
    let mut out = ManifestOptions::default();
    for (key, value) in map {
        if !ALLOWED_OPTION_KEYS.contains(&key.as_str()) {
            let mut allowed = ALLOWED_OPTION_KEYS.to_vec();
            allowed.sort_unstable();
            return Err(Error::contract(format!(
                "manifest.options only supports: {}",
                allowed.join(", ")
            )));
        }
        match key.as_str() {
            "dryRun" => out.dry_run = Some(parse_bool_option("dryRun", value)?),
            "forceFull" => out.force_full = Some(parse_bool_option("forceFull", value)?),
            "maxDocs" => {
                out.max_docs = match value {
                    Value::Null => None,
                    Value::Number(n) => {
                        let parsed = n
                            .as_i64()
                            .ok_or_else(|| Error::contract("manifest.options.maxDocs must be an integer"))?;
                        if parsed < 1 {
                            return Err(Error::contract("manifest.options.maxDocs must be >= 1"));
                        }
                        Some(parsed)
                    }
                    _ => return Err(Error::contract("manifest.options.maxDocs must be an integer")),
                };
            }
            _ => unreachable!(),
        }
    }
    Ok(out)
}

fn parse_bool_option(key: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(Error::contract(format!("manifest.options.{key} must be a boolean"))),
        },
        _ => Err(Error::contract(format!("manifest.options.{key} must be a boolean"))),
    }
}

fn build_effective_run_config(manifest: &Value, options: &ManifestOptions) -> Value {
    let mut base: Map<String, Value> = obj_get(manifest, "run")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    if let Some(dry_run) = options.dry_run {
        base.insert("dryRun".to_string(), Value::Bool(dry_run));
    }
    if let Some(force_full) = options.force_full {
        base.insert("forceFull".to_string(), Value::Bool(force_full));
    }
    if let Some(max_docs) = options.max_docs {
        base.insert("maxDocs".to_string(), Value::Number(max_docs.into()));
    }
    Value::Object(base)
}

/// Derive the ordered, deduplicated capability list a manifest job requires, from the
/// configured base capability set plus the manifest's embeddings/vectorStore/dataSources
/// declarations (spec §4.4).
pub fn derive_required_capabilities(manifest: &Value) -> Result<Vec<String>> {
    if detect_manifest_version(manifest) != "v0" {
        return Err(Error::contract(
            "only version 'v0' manifests are supported for capability derivation",
        ));
    }

    let mut seen = BTreeSet::new();
    let mut ordered = Vec::new();
    let mut add = |token: &str, seen: &mut BTreeSet<String>, ordered: &mut Vec<String>| {
        let token = token.trim().to_lowercase();
        if !token.is_empty() && seen.insert(token.clone()) {
            ordered.push(token);
        }
    };

    for base in BASE_MANIFEST_CAPABILITIES {
        add(base, &mut seen, &mut ordered);
    }

    let embeddings = obj_get(manifest, "embeddings")
        .filter(|v| v.is_object())
        .ok_or_else(|| Error::contract("embeddings block is required in manifest YAML"))?;
    let provider = clean_str(obj_get(embeddings, "provider")).to_lowercase();
    if provider.is_empty() {
        return Err(Error::contract("embeddings.provider must be set"));
    }
    let provider_capability = embedding_provider_capability(&provider)
        .ok_or_else(|| Error::contract(format!("unsupported embeddings provider '{provider}' in manifest")))?;
    add("embeddings", &mut seen, &mut ordered);
    add(provider_capability, &mut seen, &mut ordered);

    let vector_store = obj_get(manifest, "vectorStore")
        .filter(|v| v.is_object())
        .ok_or_else(|| Error::contract("vectorStore block is required in manifest YAML"))?;
    let vector_store_type = clean_str(obj_get(vector_store, "type")).to_lowercase();
    let vector_capability = vector_store_capability(&vector_store_type).ok_or_else(|| {
        Error::contract(format!(
            "unsupported vectorStore.type '{vector_store_type}' in manifest"
        ))
    })?;
    add(vector_capability, &mut seen, &mut ordered);

    let data_sources = obj_get(manifest, "dataSources")
        .and_then(|v| v.as_array())
        .filter(|arr| !arr.is_empty())
        .ok_or_else(|| Error::contract("manifest must include at least one data source"))?;
    for entry in data_sources {
        let entry = entry
            .as_object()
            .ok_or_else(|| Error::contract("each dataSources entry must be an object"))?;
        let ds_type = clean_str(entry.get("type"));
        if ds_type.is_empty() {
            return Err(Error::contract("dataSources entries must declare a type"));
        }
        let capability = data_source_capability(&ds_type.to_lowercase())
            .ok_or_else(|| Error::contract(format!("unsupported data source type '{ds_type}' in manifest")))?;
        add(capability, &mut seen, &mut ordered);
    }

    Ok(ordered)
}

/// Raise if any string value in the manifest structures looks like raw secret material
/// (spec §4.4 "manifests never carry raw credentials").
pub fn detect_manifest_secret_leaks(node: &Value) -> Result<()> {
    scan_for_secret_values(node, false)
}

fn scan_for_secret_values(node: &Value, key_hint: bool) -> Result<()> {
    match node {
        Value::Object(map) => {
            for (key, value) in map {
                let child_hint = key_hint || SENSITIVE_FIELD_NAMES.contains(&key.trim().to_lowercase().as_str());
                scan_for_secret_values(value, child_hint)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                scan_for_secret_values(item, key_hint)?;
            }
            Ok(())
        }
        Value::String(s) => {
            if value_looks_like_secret(s, key_hint) {
                Err(Error::contract(
                    "manifest contains raw secret material; replace tokens with env/profile/vault references",
                ))
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

fn value_looks_like_secret(value: &str, key_hint: bool) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return false;
    }
    if is_safe_reference(trimmed) {
        return false;
    }
    if key_hint {
        return true;
    }
    if trimmed.starts_with("-----BEGIN ") {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    let uppered = trimmed.to_uppercase();
    if SUSPECT_VALUE_PREFIXES_LOWER.iter().any(|p| lowered.starts_with(p)) {
        return true;
    }
    if SUSPECT_VALUE_PREFIXES_UPPER.iter().any(|p| uppered.starts_with(p)) {
        return true;
    }
    if SUSPECT_VALUE_SUBSTRINGS.iter().any(|t| lowered.contains(t)) {
        return true;
    }
    if looks_like_jwt(trimmed) {
        return true;
    }
    if looks_like_base64_secret(trimmed) {
        return true;
    }
    false
}

fn is_safe_reference(value: &str) -> bool {
    SAFE_REFERENCE_PREFIXES.iter().any(|p| value.starts_with(p))
        || (value.starts_with("${") && value.ends_with('}'))
}

fn looks_like_jwt(value: &str) -> bool {
    let segments: Vec<&str> = value.split('.').collect();
    if segments.len() != 3 {
        return false;
    }
    segments
        .iter()
        .all(|seg| seg.len() >= 10 && jwt_segment_pattern().is_match(seg))
}

fn looks_like_base64_secret(value: &str) -> bool {
    let compact: String = value.chars().filter(|c| *c != '\n' && *c != '\r').collect();
    compact.len() >= 40 && base64ish_pattern().is_match(&compact)
}

fn profile_env_key(provider: &str, field: &str) -> Result<String> {
    fn normalize(token: &str) -> String {
        let mut out = String::new();
        let mut last_was_sep = false;
        for ch in token.trim().chars() {
            if ch.is_ascii_alphanumeric() {
                out.push(ch);
                last_was_sep = false;
            } else if !last_was_sep {
                out.push('_');
                last_was_sep = true;
            }
        }
        out.trim_matches('_').to_string()
    }
    let provider_token = normalize(provider);
    let field_token = normalize(field);
    if provider_token.is_empty() || field_token.is_empty() {
        return Err(Error::contract(
            "profile secret references must include provider and field segments",
        ));
    }
    Ok(format!("{}_{}", provider_token.to_uppercase(), field_token.to_uppercase()))
}

fn parse_profile_reference(value: &str) -> Result<ProfileSecretRef> {
    let rest = value
        .strip_prefix("profile://")
        .ok_or_else(|| Error::contract("profile secret references must use profile:// scheme"))?;
    let (provider, field) = rest
        .split_once('#')
        .ok_or_else(|| Error::contract("profile secret references must include provider and #field segments"))?;
    let provider = provider.trim();
    let field = field.trim();
    if provider.is_empty() || field.is_empty() {
        return Err(Error::contract(
            "profile secret references must include provider and #field segments",
        ));
    }
    if !profile_token_pattern().is_match(provider) {
        return Err(Error::contract("profile secret provider contains invalid characters"));
    }
    if !profile_token_pattern().is_match(field) {
        return Err(Error::contract("profile secret field contains invalid characters"));
    }
    let env_key = profile_env_key(provider, field)?;
    Ok(ProfileSecretRef {
        provider: provider.to_lowercase(),
        field: field.to_lowercase(),
        env_key,
        normalized: format!("profile://{}#{}", provider.to_lowercase(), field.to_lowercase()),
    })
}

fn parse_vault_reference(value: &str) -> Result<VaultSecretRef> {
    let rest = value
        .strip_prefix("vault://")
        .ok_or_else(|| Error::contract("vault secret references must use vault:// scheme"))?;
    let (authority_and_path, field) = rest
        .split_once('#')
        .ok_or_else(|| Error::contract("vault secret references must include mount/path and #field"))?;
    let (mount, path) = authority_and_path
        .split_once('/')
        .ok_or_else(|| Error::contract("vault secret references must include mount/path and #field"))?;
    let mount = mount.trim();
    let path = path.trim_start_matches('/').trim();
    let field = field.trim();
    if mount.is_empty() || path.is_empty() || field.is_empty() {
        return Err(Error::contract("vault secret references must include mount/path and #field"));
    }
    if !vault_mount_pattern().is_match(mount) {
        return Err(Error::contract("vault mount contains invalid characters"));
    }
    if !vault_path_pattern().is_match(path) {
        return Err(Error::contract("vault path contains invalid characters"));
    }
    if path.split('/').any(|seg| seg == ".." || seg == ".") {
        return Err(Error::contract("vault path traversal is not allowed"));
    }
    if !vault_mount_pattern().is_match(field) {
        return Err(Error::contract("vault field contains invalid characters"));
    }
    Ok(VaultSecretRef {
        mount: mount.to_string(),
        path: path.to_string(),
        field: field.to_string(),
        reference: format!("vault://{mount}/{path}#{field}"),
    })
}

fn collect_secret_refs(manifest: &Value) -> Result<ManifestSecretRefs> {
    let mut profile_refs = Vec::new();
    let mut vault_refs = Vec::new();
    let mut seen_profile = BTreeSet::new();
    let mut seen_vault = BTreeSet::new();

    fn walk(
        value: &Value,
        profile_refs: &mut Vec<ProfileSecretRef>,
        vault_refs: &mut Vec<VaultSecretRef>,
        seen_profile: &mut BTreeSet<String>,
        seen_vault: &mut BTreeSet<String>,
    ) -> Result<()> {
        match value {
            Value::Object(map) => {
                for v in map.values() {
                    walk(v, profile_refs, vault_refs, seen_profile, seen_vault)?;
                }
            }
            Value::Array(items) => {
                for item in items {
                    walk(item, profile_refs, vault_refs, seen_profile, seen_vault)?;
                }
            }
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Ok(());
                }
                let lowered = trimmed.to_lowercase();
                if lowered.starts_with("profile://") {
                    let ref_ = parse_profile_reference(trimmed)?;
                    if seen_profile.insert(ref_.normalized.clone()) {
                        profile_refs.push(ref_);
                    }
                } else if lowered.starts_with("vault://") {
                    let ref_ = parse_vault_reference(trimmed)?;
                    if seen_vault.insert(ref_.reference.clone()) {
                        vault_refs.push(ref_);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    walk(manifest, &mut profile_refs, &mut vault_refs, &mut seen_profile, &mut seen_vault)?;
    Ok(ManifestSecretRefs {
        profile: profile_refs,
        vault: vault_refs,
    })
}

/// Normalize a `type=manifest` queue job payload for persistence (spec §4.4).
///
/// `allow_path_source` mirrors `settings.spec_workflow.allow_manifest_path_source`:
/// operators that have not opted into filesystem-backed manifests keep `path` rejected.
pub fn normalize_manifest_payload(payload: &Value, allow_path_source: bool) -> Result<ManifestView> {
    let manifest_obj = obj_get(payload, "manifest")
        .filter(|v| v.is_object())
        .ok_or_else(|| Error::contract("manifest payload is required"))?;

    let manifest_name = clean_str(obj_get(manifest_obj, "name"));
    if manifest_name.is_empty() {
        return Err(Error::contract("manifest.name must be a non-empty string"));
    }

    let action_raw = clean_str(obj_get(manifest_obj, "action"));
    let action = if action_raw.is_empty() {
        "run".to_string()
    } else {
        action_raw.to_lowercase()
    };
    if !ALLOWED_ACTIONS.contains(&action.as_str()) {
        let mut allowed = ALLOWED_ACTIONS.to_vec();
        allowed.sort_unstable();
        return Err(Error::contract(format!(
            "manifest.action must be one of: {}",
            allowed.join(", ")
        )));
    }

    let (mut source, source_content) = normalize_source(obj_get(manifest_obj, "source"), &manifest_name, allow_path_source)?;
    let parsed_manifest = parse_manifest_yaml(&source_content)?;
    detect_manifest_secret_leaks(&parsed_manifest)?;
    let manifest_version = detect_manifest_version(&parsed_manifest);
    if manifest_version != "v0" {
        return Err(Error::contract(
            "manifest version must be 'v0' per ManifestTaskSystem contract",
        ));
    }

    let metadata = obj_get(&parsed_manifest, "metadata")
        .filter(|v| v.is_object())
        .ok_or_else(|| Error::contract("manifest metadata block is required"))?;
    let metadata_name = clean_str(obj_get(metadata, "name"));
    if metadata_name.is_empty() {
        return Err(Error::contract("metadata.name must be defined in manifest YAML"));
    }
    if metadata_name != manifest_name {
        return Err(Error::contract(
            "manifest.name must match metadata.name in the manifest YAML",
        ));
    }

    let manifest_hash = compute_manifest_hash(&source_content);
    let required_capabilities = derive_required_capabilities(&parsed_manifest)?;
    let options = normalize_options(obj_get(manifest_obj, "options"))?;
    let effective_run_config = build_effective_run_config(&parsed_manifest, &options);
    let secret_refs = collect_secret_refs(&parsed_manifest)?;

    source.content_hash = manifest_hash.clone();
    source.version = manifest_version.clone();
    if source.kind == "registry" {
        source.content = None;
    }

    Ok(ManifestView {
        manifest: ManifestNormalized {
            name: manifest_name,
            action,
            source,
            options,
        },
        manifest_hash,
        manifest_version,
        required_capabilities,
        effective_run_config,
        manifest_secret_refs: if secret_refs.is_empty() {
            None
        } else {
            Some(secret_refs)
        },
    })
}

/// Redact raw manifest YAML content while keeping audit-friendly metadata for API
/// responses (spec §4.4 "manifests never re-expose inline YAML").
pub fn sanitize_manifest_for_response(payload: &Value) -> Value {
    let mut sanitized = Map::new();
    if let Some(manifest_obj) = obj_get(payload, "manifest").filter(|v| v.is_object()) {
        let mut manifest_view = Map::new();
        let name = clean_str(obj_get(manifest_obj, "name"));
        if !name.is_empty() {
            manifest_view.insert("name".to_string(), Value::String(name));
        }
        let action = clean_str(obj_get(manifest_obj, "action"));
        if !action.is_empty() {
            manifest_view.insert("action".to_string(), Value::String(action));
        }
        if let Some(source_obj) = obj_get(manifest_obj, "source").filter(|v| v.is_object()) {
            let mut source_view = Map::new();
            let kind = clean_str(obj_get(source_obj, "kind"));
            if !kind.is_empty() {
                source_view.insert("kind".to_string(), Value::String(kind));
            }
            let registry_name = clean_str(obj_get(source_obj, "name"));
            if !registry_name.is_empty() {
                source_view.insert("name".to_string(), Value::String(registry_name));
            }
            let path_value = clean_str(obj_get(source_obj, "path"));
            if !path_value.is_empty() {
                source_view.insert("path".to_string(), Value::String(path_value));
            }
            if !source_view.is_empty() {
                manifest_view.insert("source".to_string(), Value::Object(source_view));
            }
        }
        if let Some(options_obj) = obj_get(manifest_obj, "options").filter(|v| v.as_object().map(|m| !m.is_empty()).unwrap_or(false)) {
            manifest_view.insert("options".to_string(), options_obj.clone());
        }
        if !manifest_view.is_empty() {
            sanitized.insert("manifest".to_string(), Value::Object(manifest_view));
        }
    }

    let manifest_hash = clean_str(obj_get(payload, "manifestHash"));
    if !manifest_hash.is_empty() {
        sanitized.insert("manifestHash".to_string(), Value::String(manifest_hash));
    }
    let manifest_version = clean_str(obj_get(payload, "manifestVersion"));
    if !manifest_version.is_empty() {
        sanitized.insert("manifestVersion".to_string(), Value::String(manifest_version));
    }

    if let Some(caps) = obj_get(payload, "requiredCapabilities").and_then(|v| v.as_array()) {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for item in caps {
            let label = clean_str(Some(item)).to_lowercase();
            if !label.is_empty() && seen.insert(label.clone()) {
                out.push(Value::String(label));
            }
        }
        sanitized.insert("requiredCapabilities".to_string(), Value::Array(out));
    }

    if let Some(run_config) = obj_get(payload, "effectiveRunConfig").filter(|v| v.is_object()) {
        sanitized.insert("effectiveRunConfig".to_string(), run_config.clone());
    }

    if let Some(refs_obj) = obj_get(payload, "manifestSecretRefs").filter(|v| v.is_object()) {
        let mut sanitized_refs = Map::new();
        if let Some(profile_refs) = obj_get(refs_obj, "profile").and_then(|v| v.as_array()) {
            let mut cleaned = Vec::new();
            let mut seen = BTreeSet::new();
            for entry in profile_refs {
                let Some(entry) = entry.as_object() else { continue };
                let env_key = clean_str(entry.get("envKey"));
                let normalized = clean_str(entry.get("normalized"));
                if env_key.is_empty() || normalized.is_empty() || !seen.insert(normalized.clone()) {
                    continue;
                }
                let mut out = Map::new();
                out.insert("envKey".to_string(), Value::String(env_key));
                out.insert("normalized".to_string(), Value::String(normalized));
                out.insert("provider".to_string(), Value::String(clean_str(entry.get("provider"))));
                out.insert("field".to_string(), Value::String(clean_str(entry.get("field"))));
                cleaned.push(Value::Object(out));
            }
            if !cleaned.is_empty() {
                sanitized_refs.insert("profile".to_string(), Value::Array(cleaned));
            }
        }
        if let Some(vault_refs) = obj_get(refs_obj, "vault").and_then(|v| v.as_array()) {
            let mut cleaned = Vec::new();
            let mut seen = BTreeSet::new();
            for entry in vault_refs {
                let Some(entry) = entry.as_object() else { continue };
                let reference = clean_str(entry.get("ref"));
                if reference.is_empty() || !seen.insert(reference.clone()) {
                    continue;
                }
                let mut out = Map::new();
                out.insert("ref".to_string(), Value::String(reference));
                out.insert("mount".to_string(), Value::String(clean_str(entry.get("mount"))));
                out.insert("path".to_string(), Value::String(clean_str(entry.get("path"))));
                out.insert("field".to_string(), Value::String(clean_str(entry.get("field"))));
                cleaned.push(Value::Object(out));
            }
            if !cleaned.is_empty() {
                sanitized_refs.insert("vault".to_string(), Value::Array(cleaned));
            }
        }
        if !sanitized_refs.is_empty() {
            sanitized.insert("manifestSecretRefs".to_string(), Value::Object(sanitized_refs));
        }
    }

    Value::Object(sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST_YAML: &str = r#"
version: v0
metadata:
  name: docs-indexer
embeddings:
  provider: openai
vectorStore:
  type: qdrant
dataSources:
  - type: GitHubRepositoryReader
run:
  schedule: nightly
"#;

    fn payload(content: &str) -> Value {
        serde_json::json!({
            "manifest": {
                "name": "docs-indexer",
                "action": "run",
                "source": {"kind": "inline", "content": content},
                "options": {"dryRun": true, "maxDocs": 50}
            }
        })
    }

    #[test]
    fn normalizes_inline_manifest_and_derives_capabilities() {
        let view = normalize_manifest_payload(&payload(MANIFEST_YAML), false).unwrap();
        assert_eq!(view.manifest_version, "v0");
        assert_eq!(
            view.required_capabilities,
            vec!["manifest", "embeddings", "openai", "qdrant", "github"]
        );
        assert_eq!(view.manifest.options.max_docs, Some(50));
        assert!(view.manifest_hash.starts_with("sha256:"));
    }

    #[test]
    fn rejects_name_mismatch() {
        let yaml = MANIFEST_YAML.replace("docs-indexer", "other-name");
        let mut p = payload(&yaml);
        p["manifest"]["source"]["content"] = Value::String(yaml.clone());
        let err = normalize_manifest_payload(&p, false).unwrap_err();
        assert!(matches!(err, Error::Contract { .. }));
    }

    #[test]
    fn detects_raw_secret_values() {
        let yaml = format!("{MANIFEST_YAML}\nsecrets:\n  api_key: sk-abcdef1234567890\n");
        let err = normalize_manifest_payload(&payload(&yaml), false).unwrap_err();
        assert!(matches!(err, Error::Contract { .. }));
    }

    #[test]
    fn allows_vault_and_profile_references() {
        let yaml = format!(
            "{MANIFEST_YAML}\ncredentials:\n  token: vault://secret/data/docs#token\n  other: profile://openai#api_key\n"
        );
        let view = normalize_manifest_payload(&payload(&yaml), false).unwrap();
        let refs = view.manifest_secret_refs.unwrap();
        assert_eq!(refs.vault[0].reference, "vault://secret/data/docs#token");
        assert_eq!(refs.profile[0].normalized, "profile://openai#api_key");
    }

    #[test]
    fn path_source_rejected_unless_allowed() {
        let mut p = payload(MANIFEST_YAML);
        p["manifest"]["source"] = serde_json::json!({"kind": "path", "path": "manifests/docs.yaml", "content": MANIFEST_YAML});
        let err = normalize_manifest_payload(&p, false).unwrap_err();
        assert!(matches!(err, Error::Contract { .. }));
        let ok = normalize_manifest_payload(&p, true);
        assert!(ok.is_ok());
    }

    #[test]
    fn sanitize_strips_inline_content() {
        let view = normalize_manifest_payload(&payload(MANIFEST_YAML), false).unwrap();
        let sanitized = sanitize_manifest_for_response(&view.to_json());
        assert!(sanitized["manifest"]["source"].get("content").is_none());
        assert_eq!(sanitized["manifestHash"], view.manifest_hash.as_str());
    }
}
