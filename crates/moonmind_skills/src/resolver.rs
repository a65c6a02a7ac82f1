//! Per-run skill selection and source resolution (spec §4.9 "Resolver"), grounded on
//! `workflows/skills/resolver.py`'s `resolve_run_skill_selection`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use moonmind_core::error::{Error, Result};
use url::Url;

use crate::types::{ResolvedSkill, RunSkillSelection, SelectionSource};

fn skill_name_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").unwrap())
}

/// Validate and normalize a skill name for filesystem-safe use.
pub fn validate_skill_name(skill_name: &str) -> Result<String> {
    let normalized = skill_name.trim();
    if normalized.is_empty() {
        return Err(Error::validation("skill name cannot be blank"));
    }
    if normalized.contains('/') || normalized.contains('\\') || normalized.contains("..") {
        return Err(Error::validation(format!(
            "invalid skill name '{skill_name}': path separators and '..' are not allowed"
        )));
    }
    if !skill_name_pattern().is_match(normalized) {
        return Err(Error::validation(format!(
            "invalid skill name '{skill_name}': only letters, digits, underscores, and dashes are allowed"
        )));
    }
    Ok(normalized.to_string())
}

/// Which policy an unqualified skill entry (bare name, no explicit source) resolves
/// against when the selection falls through to the global default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillPolicyMode {
    Allowlist,
    Permissive,
}

/// One requested skill entry before source resolution — either a bare name (`"speckit"`
/// or `"speckit:v2"`) or a fully-specified override.
#[derive(Debug, Clone, Default)]
pub struct SkillSelectionEntry {
    pub skill_name: String,
    pub version: Option<String>,
    pub source_uri: Option<String>,
    pub content_hash: Option<String>,
    pub signature: Option<String>,
}

impl SkillSelectionEntry {
    pub fn named(skill_name: impl Into<String>) -> Self {
        Self {
            skill_name: skill_name.into(),
            ..Default::default()
        }
    }
}

fn normalize_entry(entry: &SkillSelectionEntry) -> Result<SkillSelectionEntry> {
    let skill_name = validate_skill_name(&entry.skill_name)?;
    let version = entry
        .version
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("local")
        .to_string();
    Ok(SkillSelectionEntry {
        skill_name,
        version: Some(version),
        source_uri: entry.source_uri.clone(),
        content_hash: entry.content_hash.clone(),
        signature: entry.signature.clone(),
    })
}

/// Knobs the resolver needs from `moonmind_core::Config` (narrowed per the service
/// pattern other crates use).
#[derive(Debug, Clone)]
pub struct SkillResolverConfig {
    pub skills_local_mirror_root: Option<PathBuf>,
    pub skills_legacy_mirror_root: Option<PathBuf>,
    pub skill_policy_mode: SkillPolicyMode,
    pub allowed_skills: Vec<String>,
    pub default_skill: String,
}

fn file_uri(path: &Path) -> Result<String> {
    let canonical = path
        .canonicalize()
        .map_err(|e| Error::validation(format!("cannot resolve local skill mirror path: {e}")))?;
    Url::from_file_path(&canonical)
        .map(|u| u.to_string())
        .map_err(|_| Error::validation(format!("cannot build file:// URI for {canonical:?}")))
}

fn resolve_local_source(config: &SkillResolverConfig, skill_name: &str) -> Option<String> {
    for root in [&config.skills_local_mirror_root, &config.skills_legacy_mirror_root]
        .into_iter()
        .flatten()
    {
        let candidate = root.join(skill_name);
        if candidate.is_dir() {
            if let Ok(uri) = file_uri(&candidate) {
                return Some(uri);
            }
        }
    }
    None
}

fn resolve_source_uri(
    config: &SkillResolverConfig,
    skill_name: &str,
    version: &str,
    declared_source: Option<&str>,
    source_overrides: Option<&HashMap<String, String>>,
) -> Result<String> {
    if let Some(declared) = declared_source {
        if !declared.trim().is_empty() {
            return Ok(declared.trim().to_string());
        }
    }

    if let Some(overrides) = source_overrides {
        let keyed = overrides.get(&format!("{skill_name}:{version}"));
        let fallback = overrides.get(skill_name);
        if let Some(uri) = keyed.or(fallback) {
            if !uri.trim().is_empty() {
                return Ok(uri.trim().to_string());
            }
        }
    }

    if let Some(local) = resolve_local_source(config, skill_name) {
        return Ok(local);
    }

    // Preserve backward compatibility for the built-in Speckit execution path.
    if skill_name == "speckit" {
        return Ok("builtin://speckit".to_string());
    }

    Err(Error::validation(format!(
        "no source URI resolved for skill '{skill_name}:{version}'; provide a skill source \
         override or configure a local mirror root"
    )))
}

/// Discover skill names from the configured local/legacy mirror roots, for permissive
/// auto-selection when neither a job override nor a queue profile is present.
fn discover_local_skill_names(config: &SkillResolverConfig) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut discovered = Vec::new();
    for root in [&config.skills_local_mirror_root, &config.skills_legacy_mirror_root]
        .into_iter()
        .flatten()
    {
        let mut entries: Vec<_> = match std::fs::read_dir(root) {
            Ok(entries) => entries.filter_map(|e| e.ok()).collect(),
            Err(_) => continue,
        };
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            if !path.is_dir() || !path.join("SKILL.md").is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(validated) = validate_skill_name(name) else {
                continue;
            };
            if seen.insert(validated.clone()) {
                discovered.push(validated);
            }
        }
    }
    discovered
}

/// Resolve the effective skill set for a workflow run: the first non-empty of (job
/// override, queue profile, global default), each entry resolved to a concrete source
/// URI.
pub fn resolve_run_skill_selection(
    run_id: &str,
    config: &SkillResolverConfig,
    job_override: Option<&[SkillSelectionEntry]>,
    queue_profile: Option<&[SkillSelectionEntry]>,
    source_overrides: Option<&HashMap<String, String>>,
) -> Result<RunSkillSelection> {
    let (raw_selection, selection_source): (Vec<SkillSelectionEntry>, SelectionSource) =
        if let Some(entries) = job_override.filter(|e| !e.is_empty()) {
            (entries.to_vec(), SelectionSource::JobOverride)
        } else if let Some(entries) = queue_profile.filter(|e| !e.is_empty()) {
            (entries.to_vec(), SelectionSource::QueueProfile)
        } else {
            let selection = match config.skill_policy_mode {
                SkillPolicyMode::Allowlist => {
                    let mut allowed = config.allowed_skills.clone();
                    if !config.default_skill.is_empty()
                        && !allowed.iter().any(|s| s == &config.default_skill)
                    {
                        allowed.push(config.default_skill.clone());
                    }
                    allowed
                }
                SkillPolicyMode::Permissive => {
                    let mut names = Vec::new();
                    if !config.default_skill.is_empty() {
                        names.push(config.default_skill.clone());
                    }
                    names.extend(discover_local_skill_names(config));
                    let mut seen = HashSet::new();
                    names.retain(|n| seen.insert(n.clone()));
                    names
                }
            };
            (
                selection.into_iter().map(SkillSelectionEntry::named).collect(),
                SelectionSource::GlobalDefault,
            )
        };

    if raw_selection.is_empty() {
        return Err(Error::validation("resolved skill selection is empty"));
    }

    let mut resolved = Vec::with_capacity(raw_selection.len());
    let mut seen_names = HashSet::new();

    for entry in &raw_selection {
        let entry = normalize_entry(entry)?;
        if !seen_names.insert(entry.skill_name.clone()) {
            return Err(Error::validation(format!(
                "duplicate skill name '{}' in resolved selection",
                entry.skill_name
            )));
        }
        let version = entry.version.as_deref().unwrap_or("local");
        let source_uri = resolve_source_uri(
            config,
            &entry.skill_name,
            version,
            entry.source_uri.as_deref(),
            source_overrides,
        )?;

        if source_uri.contains("://") {
            let parsed = Url::parse(&source_uri).map_err(|_| {
                Error::validation(format!(
                    "invalid source URI for skill '{}': {source_uri}",
                    entry.skill_name
                ))
            })?;
            if parsed.scheme().is_empty() {
                return Err(Error::validation(format!(
                    "invalid source URI for skill '{}': {source_uri}",
                    entry.skill_name
                )));
            }
        }

        resolved.push(ResolvedSkill {
            skill_name: entry.skill_name,
            version: version.to_string(),
            source_uri,
            content_hash: entry.content_hash,
            signature: entry.signature,
        });
    }

    Ok(RunSkillSelection {
        run_id: run_id.to_string(),
        selection_source,
        skills: resolved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SkillResolverConfig {
        SkillResolverConfig {
            skills_local_mirror_root: None,
            skills_legacy_mirror_root: None,
            skill_policy_mode: SkillPolicyMode::Allowlist,
            allowed_skills: vec![],
            default_skill: "speckit".to_string(),
        }
    }

    #[test]
    fn rejects_path_separators_in_skill_name() {
        assert!(validate_skill_name("../evil").is_err());
        assert!(validate_skill_name("a/b").is_err());
        assert!(validate_skill_name("").is_err());
    }

    #[test]
    fn falls_back_to_builtin_speckit_source() {
        let selection = resolve_run_skill_selection("run-1", &config(), None, None, None).unwrap();
        assert_eq!(selection.selection_source, SelectionSource::GlobalDefault);
        assert_eq!(selection.skills.len(), 1);
        assert_eq!(selection.skills[0].skill_name, "speckit");
        assert_eq!(selection.skills[0].source_uri, "builtin://speckit");
    }

    #[test]
    fn job_override_takes_priority_over_queue_profile() {
        let job_override = vec![SkillSelectionEntry {
            skill_name: "speckit".to_string(),
            source_uri: Some("builtin://speckit".to_string()),
            ..Default::default()
        }];
        let queue_profile = vec![SkillSelectionEntry::named("other")];
        let selection = resolve_run_skill_selection(
            "run-1",
            &config(),
            Some(&job_override),
            Some(&queue_profile),
            None,
        )
        .unwrap();
        assert_eq!(selection.selection_source, SelectionSource::JobOverride);
        assert_eq!(selection.skills[0].skill_name, "speckit");
    }

    #[test]
    fn rejects_duplicate_skill_names_in_selection() {
        let entries = vec![
            SkillSelectionEntry {
                skill_name: "speckit".to_string(),
                source_uri: Some("builtin://speckit".to_string()),
                ..Default::default()
            },
            SkillSelectionEntry {
                skill_name: "speckit".to_string(),
                source_uri: Some("builtin://speckit".to_string()),
                ..Default::default()
            },
        ];
        let err = resolve_run_skill_selection("run-1", &config(), Some(&entries), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn source_overrides_take_priority_over_local_mirror() {
        let mut overrides = HashMap::new();
        overrides.insert("custom".to_string(), "git+https://example.com/skill.git".to_string());
        let entries = vec![SkillSelectionEntry::named("custom")];
        let selection = resolve_run_skill_selection(
            "run-1",
            &config(),
            Some(&entries),
            None,
            Some(&overrides),
        )
        .unwrap();
        assert_eq!(
            selection.skills[0].source_uri,
            "git+https://example.com/skill.git"
        );
    }

    #[test]
    fn unresolvable_name_without_source_is_rejected() {
        let entries = vec![SkillSelectionEntry::named("mystery")];
        let err = resolve_run_skill_selection("run-1", &config(), Some(&entries), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
