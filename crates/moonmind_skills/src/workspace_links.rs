//! Filesystem helpers for shared Codex/Gemini skill adapter links (spec §4.9
//! "Workspace adapters"), grounded on `workflows/skills/workspace_links.py`.

use std::path::{Path, PathBuf};

use moonmind_core::error::{Error, MaterializationCode, Result};

use crate::types::SkillWorkspaceLinks;

fn replace_link(path: &Path, target: &Path) -> Result<()> {
    if path.is_symlink() {
        let current = std::fs::canonicalize(path).ok();
        let wanted = std::fs::canonicalize(target).ok();
        if current.is_some() && current == wanted {
            return Ok(());
        }
        std::fs::remove_file(path)?;
    } else if path.exists() {
        return Err(Error::materialization(
            MaterializationCode::WorkspaceLinkFailed,
            format!("cannot create adapter link at {path:?}: existing non-symlink path present"),
        ));
    }

    let parent = path.parent().unwrap_or(path);
    std::fs::create_dir_all(parent)?;
    let relative_target = pathdiff(target, parent);
    #[cfg(unix)]
    std::os::unix::fs::symlink(&relative_target, path)?;
    #[cfg(not(unix))]
    std::fs::hard_link(&relative_target, path)?;
    Ok(())
}

/// `target` expressed relative to `from` (both assumed to share a common ancestor
/// beneath the run root), mirroring `os.path.relpath`.
fn pathdiff(target: &Path, from: &Path) -> PathBuf {
    let target_components: Vec<_> = target.components().collect();
    let from_components: Vec<_> = from.components().collect();
    let common = target_components
        .iter()
        .zip(from_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in common..from_components.len() {
        result.push("..");
    }
    for component in &target_components[common..] {
        result.push(component.as_os_str());
    }
    result
}

/// Create (or refresh) `.agents/skills` and `.gemini/skills` relative symlinks to
/// `skills_active`.
pub fn ensure_shared_skill_links(
    run_root: &Path,
    skills_active_path: &Path,
) -> Result<SkillWorkspaceLinks> {
    if !skills_active_path.is_dir() {
        return Err(Error::materialization(
            MaterializationCode::WorkspaceLinkFailed,
            format!("skills_active path does not exist or is not a directory: {skills_active_path:?}"),
        ));
    }

    let agents_skills = run_root.join(".agents").join("skills");
    let gemini_skills = run_root.join(".gemini").join("skills");

    replace_link(&agents_skills, skills_active_path)?;
    replace_link(&gemini_skills, skills_active_path)?;

    let links = SkillWorkspaceLinks {
        skills_active_path: skills_active_path.to_path_buf(),
        agents_skills_path: agents_skills,
        gemini_skills_path: gemini_skills,
    };
    validate_shared_skill_links(&links)?;
    Ok(links)
}

/// Validate adapter symlink invariants for a run workspace: all three paths resolve
/// to the same underlying directory.
pub fn validate_shared_skill_links(links: &SkillWorkspaceLinks) -> Result<()> {
    if !links.skills_active_path.is_dir() {
        return Err(Error::materialization(
            MaterializationCode::WorkspaceLinkFailed,
            format!("skills_active directory missing: {:?}", links.skills_active_path),
        ));
    }
    if !links.agents_skills_path.is_symlink() {
        return Err(Error::materialization(
            MaterializationCode::WorkspaceLinkFailed,
            format!("expected symlink at {:?}", links.agents_skills_path),
        ));
    }
    if !links.gemini_skills_path.is_symlink() {
        return Err(Error::materialization(
            MaterializationCode::WorkspaceLinkFailed,
            format!("expected symlink at {:?}", links.gemini_skills_path),
        ));
    }

    let active_resolved = std::fs::canonicalize(&links.skills_active_path)?;
    let agents_resolved = std::fs::canonicalize(&links.agents_skills_path)?;
    let gemini_resolved = std::fs::canonicalize(&links.gemini_skills_path)?;

    if agents_resolved != active_resolved {
        return Err(Error::materialization(
            MaterializationCode::WorkspaceLinkFailed,
            ".agents/skills does not resolve to skills_active",
        ));
    }
    if gemini_resolved != active_resolved {
        return Err(Error::materialization(
            MaterializationCode::WorkspaceLinkFailed,
            ".gemini/skills does not resolve to skills_active",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("moonmind-skills-links-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn creates_both_adapter_links_pointing_at_skills_active() {
        let run_root = tempdir();
        let skills_active = run_root.join("skills_active");
        std::fs::create_dir_all(&skills_active).unwrap();

        let links = ensure_shared_skill_links(&run_root, &skills_active).unwrap();
        assert!(links.agents_skills_path.is_symlink());
        assert!(links.gemini_skills_path.is_symlink());

        std::fs::remove_dir_all(&run_root).ok();
    }

    #[test]
    fn refuses_to_overwrite_a_non_symlink_path() {
        let run_root = tempdir();
        let skills_active = run_root.join("skills_active");
        std::fs::create_dir_all(&skills_active).unwrap();
        std::fs::create_dir_all(run_root.join(".agents").join("skills")).unwrap();

        let err = ensure_shared_skill_links(&run_root, &skills_active).unwrap_err();
        assert!(matches!(err, Error::Materialization { .. }));

        std::fs::remove_dir_all(&run_root).ok();
    }
}
