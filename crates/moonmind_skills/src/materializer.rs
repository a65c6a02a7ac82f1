//! Skill artifact verification and shared workspace materialization (spec §4.9
//! "Materializer" and "Archive extraction policy"), grounded on
//! `workflows/skills/materializer.py`.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use url::Url;

use moonmind_core::error::{Error, MaterializationCode, Result};

use crate::resolver::validate_skill_name;
use crate::types::{MaterializedSkill, MaterializedSkillWorkspace, ResolvedSkill, RunSkillSelection};
use crate::workspace_links::ensure_shared_skill_links;

const HTTP_FETCH_TIMEOUT_SECONDS: u64 = 30;

fn materialization_err(code: MaterializationCode, message: impl Into<String>) -> Error {
    Error::materialization(code, message)
}

/// Fetches, verifies, caches, and links skill bundles into a run-scoped workspace.
pub struct SkillMaterializer {
    http: reqwest::Client,
}

impl SkillMaterializer {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_FETCH_TIMEOUT_SECONDS))
            .build()
            .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
        Ok(Self { http })
    }

    /// Resolve, verify, cache, and link a run-local shared skills workspace.
    pub async fn materialize_run_skill_workspace(
        &self,
        selection: &RunSkillSelection,
        run_root: &Path,
        cache_root: &Path,
        verify_signatures: bool,
    ) -> Result<MaterializedSkillWorkspace> {
        tokio::fs::create_dir_all(cache_root).await?;

        let skills_active_path = run_root.join("skills_active");
        tokio::fs::create_dir_all(&skills_active_path).await?;
        clear_directory(&skills_active_path).await?;

        let mut materialized = Vec::with_capacity(selection.skills.len());
        let mut seen_names = HashSet::new();

        for entry in &selection.skills {
            if !seen_names.insert(entry.skill_name.clone()) {
                return Err(materialization_err(
                    MaterializationCode::DuplicateSkillName,
                    format!("duplicate skill name in selection: {}", entry.skill_name),
                ));
            }
            if verify_signatures && entry.signature.is_none() {
                return Err(materialization_err(
                    MaterializationCode::SignatureMissing,
                    format!(
                        "skill '{}:{}' is missing a required signature",
                        entry.skill_name, entry.version
                    ),
                ));
            }
            let result = self.materialize_cache_entry(entry, cache_root).await?;
            materialized.push(result);
        }

        for item in &materialized {
            let target = skills_active_path.join(&item.name);
            if target.exists() || target.is_symlink() {
                let _ = std::fs::remove_file(&target);
            }
            symlink(&item.cache_path, &target)?;
        }

        let links = ensure_shared_skill_links(run_root, &skills_active_path)?;

        Ok(MaterializedSkillWorkspace {
            run_id: selection.run_id.clone(),
            selection_source: selection.selection_source,
            run_root: run_root.to_path_buf(),
            cache_root: cache_root.to_path_buf(),
            links,
            skills: materialized,
        })
    }

    async fn materialize_cache_entry(
        &self,
        entry: &ResolvedSkill,
        cache_root: &Path,
    ) -> Result<MaterializedSkill> {
        let skill_name = validate_skill_name(&entry.skill_name)?;
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("skill-{skill_name}-"))
            .tempdir()
            .map_err(Error::from)?;

        let source_root = self.resolve_source_root(entry, temp_dir.path()).await?;
        let skill_dir = find_skill_dir(&source_root, &skill_name)?;
        validate_skill_metadata(entry, &skill_dir)?;

        let skill_dir_owned = skill_dir.clone();
        let computed_hash =
            tokio::task::spawn_blocking(move || hash_skill_directory(&skill_dir_owned))
                .await
                .map_err(|e| Error::Internal(anyhow::anyhow!(e)))??;

        if let Some(expected) = &entry.content_hash {
            if expected != &computed_hash {
                return Err(materialization_err(
                    MaterializationCode::HashMismatch,
                    format!(
                        "hash mismatch for '{skill_name}:{}' (expected {expected}, got {computed_hash})",
                        entry.version
                    ),
                ));
            }
        }

        let skill_hash_root = cache_root.join(&computed_hash);
        let skill_cache_dir = skill_hash_root.join(&skill_name);
        if !skill_cache_dir.exists() {
            tokio::fs::create_dir_all(&skill_hash_root).await?;
            let staging_dir =
                skill_hash_root.join(format!(".{skill_name}.tmp-{}", uuid::Uuid::new_v4().simple()));
            copy_dir_recursive(&skill_dir, &staging_dir)?;
            mark_read_only(&staging_dir)?;
            match std::fs::rename(&staging_dir, &skill_cache_dir) {
                Ok(()) => {}
                Err(_) if skill_cache_dir.exists() => {
                    // Concurrent run already materialized the same digest.
                    let _ = std::fs::remove_dir_all(&staging_dir);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(MaterializedSkill {
            name: skill_name,
            version: entry.version.clone(),
            source_uri: entry.source_uri.clone(),
            content_hash: computed_hash,
            cache_path: skill_cache_dir,
        })
    }

    async fn resolve_source_root(&self, entry: &ResolvedSkill, scratch_dir: &Path) -> Result<PathBuf> {
        let skill_name = validate_skill_name(&entry.skill_name)?;
        let source_uri = entry.source_uri.trim();

        if let Some(repo_uri) = source_uri.strip_prefix("git+") {
            let destination = scratch_dir.join(format!("git-{skill_name}"));
            let status = tokio::process::Command::new("git")
                .args(["clone", "--depth", "1", "--", repo_uri.trim()])
                .arg(&destination)
                .status()
                .await
                .map_err(|e| {
                    materialization_err(
                        MaterializationCode::GitFetchFailed,
                        format!("unable to clone git skill source for {skill_name}: {e}"),
                    )
                })?;
            if !status.success() {
                return Err(materialization_err(
                    MaterializationCode::GitFetchFailed,
                    format!("git clone exited with {status} for {skill_name}"),
                ));
            }
            return Ok(destination);
        }

        let parsed = Url::parse(source_uri).ok();
        let scheme = parsed.as_ref().map(|u| u.scheme().to_string());
        match scheme.as_deref() {
            Some("builtin") => {
                let builtin_root = scratch_dir.join(format!("builtin-{skill_name}")).join(&skill_name);
                tokio::fs::create_dir_all(&builtin_root).await?;
                tokio::fs::write(
                    builtin_root.join("SKILL.md"),
                    format!("---\nname: {skill_name}\ndescription: Built-in MoonMind skill\n---\n"),
                )
                .await?;
                tokio::fs::write(
                    builtin_root.join("README.md"),
                    "Built-in compatibility skill generated by the MoonMind runtime.\n",
                )
                .await?;
                Ok(builtin_root)
            }
            Some("http") | Some("https") => {
                let download_path = scratch_dir.join(format!("bundle-{skill_name}"));
                self.download_remote_bundle(source_uri, &download_path).await?;
                let extracted = scratch_dir.join(format!("bundle-extract-{skill_name}"));
                tokio::fs::create_dir_all(&extracted).await?;
                extract_archive_blocking(download_path, extracted.clone()).await?;
                Ok(extracted)
            }
            Some("file") => {
                let candidate = parsed.unwrap().to_file_path().map_err(|_| {
                    materialization_err(
                        MaterializationCode::SourceNotFound,
                        format!("invalid file:// source URI for {skill_name}: {source_uri}"),
                    )
                })?;
                self.resolve_path_source(candidate, &skill_name, scratch_dir).await
            }
            Some(other) => Err(materialization_err(
                MaterializationCode::UnsupportedSourceScheme,
                format!("unsupported source URI scheme '{other}' for {skill_name}"),
            )),
            None => {
                let candidate = PathBuf::from(source_uri);
                self.resolve_path_source(candidate, &skill_name, scratch_dir).await
            }
        }
    }

    async fn resolve_path_source(
        &self,
        candidate: PathBuf,
        skill_name: &str,
        scratch_dir: &Path,
    ) -> Result<PathBuf> {
        let candidate = if candidate.is_absolute() {
            candidate
        } else {
            std::env::current_dir()?.join(candidate)
        };
        if candidate.is_dir() {
            return Ok(candidate);
        }
        if candidate.is_file() {
            let extracted = scratch_dir.join(format!("bundle-extract-{skill_name}"));
            tokio::fs::create_dir_all(&extracted).await?;
            extract_archive_blocking(candidate, extracted.clone()).await?;
            return Ok(extracted);
        }
        Err(materialization_err(
            MaterializationCode::SourceNotFound,
            format!("skill source path does not exist for {skill_name}: {candidate:?}"),
        ))
    }

    async fn download_remote_bundle(&self, source_uri: &str, destination: &Path) -> Result<()> {
        validate_public_remote_host(source_uri).await?;
        let response = self.http.get(source_uri).send().await.map_err(|e| {
            materialization_err(
                MaterializationCode::BundleFetchFailed,
                format!("unable to download skill bundle from {source_uri}: {e}"),
            )
        })?;
        validate_public_remote_host(response.url().as_str()).await?;
        let bytes = response.bytes().await.map_err(|e| {
            materialization_err(
                MaterializationCode::BundleFetchFailed,
                format!("unable to read skill bundle response from {source_uri}: {e}"),
            )
        })?;
        tokio::fs::write(destination, bytes).await?;
        Ok(())
    }
}

/// Reject any resolved address that is private/loopback/link-local/multicast/
/// reserved/unspecified — this is the SSRF guard for remote skill bundle fetches.
async fn validate_public_remote_host(source_uri: &str) -> Result<()> {
    let parsed = Url::parse(source_uri).map_err(|_| {
        materialization_err(
            MaterializationCode::BundleFetchFailed,
            format!("invalid skill bundle source URI: {source_uri}"),
        )
    })?;
    let host = parsed.host_str().ok_or_else(|| {
        materialization_err(
            MaterializationCode::BundleFetchFailed,
            format!("skill bundle source URI is missing a hostname: {source_uri}"),
        )
    })?;
    let port = parsed
        .port_or_known_default()
        .unwrap_or(if parsed.scheme() == "https" { 443 } else { 80 });

    let addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
        materialization_err(
            MaterializationCode::BundleFetchFailed,
            format!("unable to resolve skill bundle host '{host}': {e}"),
        )
    })?;

    let mut any = false;
    for addr in addrs {
        any = true;
        if !is_public_address(addr.ip()) {
            return Err(materialization_err(
                MaterializationCode::BundleFetchFailed,
                format!("skill bundle source host resolves to a non-public address: {host}"),
            ));
        }
    }
    if !any {
        return Err(materialization_err(
            MaterializationCode::BundleFetchFailed,
            format!("unable to resolve skill bundle host '{host}': no addresses returned"),
        ));
    }
    Ok(())
}

fn is_public_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation())
        }
        IpAddr::V6(v6) => {
            let is_unique_local = v6.segments()[0] & 0xfe00 == 0xfc00;
            let is_unicast_link_local = v6.segments()[0] & 0xffc0 == 0xfe80;
            !(v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || is_unique_local
                || is_unicast_link_local)
        }
    }
}

fn symlink(target: &Path, link: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        std::os::windows::fs::symlink_dir(target, link)?;
        Ok(())
    }
}

async fn clear_directory(path: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let child = entry.path();
        if child.is_symlink() || child.is_file() {
            tokio::fs::remove_file(&child).await?;
        } else if child.is_dir() {
            tokio::fs::remove_dir_all(&child).await?;
        }
    }
    Ok(())
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
        let rel = entry.path().strip_prefix(src).expect("walkdir entry under src");
        let target = dst.join(rel);
        if entry.file_type().is_symlink() {
            let link_target = std::fs::read_link(entry.path())?;
            symlink(&link_target, &target)?;
        } else if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn mark_read_only(path: &Path) -> Result<()> {
    if path.is_symlink() {
        return Ok(());
    }
    if path.is_dir() {
        #[cfg(unix)]
        std::fs::set_permissions(path, std::os::unix::fs::PermissionsExt::from_mode(0o555))?;
        for entry in std::fs::read_dir(path)? {
            mark_read_only(&entry?.path())?;
        }
        return Ok(());
    }
    #[cfg(unix)]
    std::fs::set_permissions(path, std::os::unix::fs::PermissionsExt::from_mode(0o444))?;
    Ok(())
}

/// Stable content hash over a skill directory: walk paths in sorted order, hashing
/// each relative path plus either file bytes or the symlink target.
fn hash_skill_directory(skill_dir: &Path) -> Result<String> {
    let mut entries: Vec<_> = walkdir::WalkDir::new(skill_dir)
        .min_depth(0)
        .into_iter()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
    entries.sort_by(|a, b| a.path().cmp(b.path()));

    let mut digest = Sha256::new();
    for entry in entries {
        if entry.path() == skill_dir {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(skill_dir)
            .expect("walkdir entry under skill_dir")
            .to_string_lossy()
            .replace('\\', "/");
        digest.update(rel.as_bytes());
        if entry.file_type().is_symlink() {
            digest.update(b"SYMLINK");
            let target = std::fs::read_link(entry.path())?;
            digest.update(target.to_string_lossy().as_bytes());
        } else if entry.file_type().is_dir() {
            digest.update(b"DIR");
        } else {
            digest.update(b"FILE");
            let bytes = std::fs::read(entry.path())?;
            digest.update(&bytes);
        }
    }
    Ok(hex::encode(digest.finalize()))
}

fn parse_frontmatter_name(skill_md: &Path) -> Result<Option<String>> {
    let raw = std::fs::read_to_string(skill_md).map_err(|e| {
        materialization_err(
            MaterializationCode::MissingSkillMd,
            format!("unable to read skill metadata file: {skill_md:?} ({e})"),
        )
    })?;
    if !raw.starts_with("---") {
        return Ok(None);
    }
    let lines: Vec<&str> = raw.lines().collect();
    let Some(end_index) = lines.iter().skip(1).position(|l| *l == "---") else {
        return Ok(None);
    };
    for line in &lines[1..=end_index] {
        if let Some(rest) = line.trim().strip_prefix("name:") {
            let parsed = rest.trim().trim_matches('"').trim_matches('\'');
            return Ok((!parsed.is_empty()).then(|| parsed.to_string()));
        }
    }
    Ok(None)
}

fn find_skill_dir(root: &Path, skill_name: &str) -> Result<PathBuf> {
    if root.file_name().and_then(|n| n.to_str()) == Some(skill_name) {
        return Ok(root.to_path_buf());
    }

    let direct = root.join(skill_name);
    if direct.is_dir() && direct.join("SKILL.md").is_file() {
        return Ok(direct);
    }

    let mut candidates = Vec::new();
    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_name() == "SKILL.md" {
            if let Some(parent) = entry.path().parent() {
                if parent.file_name().and_then(|n| n.to_str()) == Some(skill_name) {
                    return Ok(parent.to_path_buf());
                }
                candidates.push(parent.to_path_buf());
            }
        }
    }
    if candidates.len() == 1 {
        return Ok(candidates.remove(0));
    }

    Err(materialization_err(
        MaterializationCode::SourceNotFound,
        format!("unable to locate skill directory for '{skill_name}' in source root {root:?}"),
    ))
}

fn validate_skill_metadata(entry: &ResolvedSkill, skill_dir: &Path) -> Result<()> {
    let skill_md = skill_dir.join("SKILL.md");
    if !skill_md.is_file() {
        return Err(materialization_err(
            MaterializationCode::MissingSkillMd,
            format!("missing SKILL.md for skill '{}' in {skill_dir:?}", entry.skill_name),
        ));
    }

    let dir_name = skill_dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if let Some(metadata_name) = parse_frontmatter_name(&skill_md)? {
        if metadata_name != dir_name {
            return Err(materialization_err(
                MaterializationCode::SkillNameMismatch,
                format!(
                    "skill metadata name '{metadata_name}' does not match directory '{dir_name}'"
                ),
            ));
        }
    }
    if dir_name != entry.skill_name {
        return Err(materialization_err(
            MaterializationCode::SkillNameMismatch,
            format!(
                "resolved skill name '{}' does not match directory '{dir_name}'",
                entry.skill_name
            ),
        ));
    }
    Ok(())
}

async fn extract_archive_blocking(archive: PathBuf, destination: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || extract_archive(&archive, &destination))
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?
}

/// Reject any member path that is absolute, contains `..`, or whose canonical target
/// escapes the extraction root; reject symlink/hardlink/device members entirely.
fn extract_archive(archive: &Path, destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination)?;
    let destination_root = destination.canonicalize()?;

    let validate_member = |name: &str| -> Result<PathBuf> {
        let normalized = name.replace('\\', "/");
        let member = Path::new(&normalized);
        if member.is_absolute() || member.components().any(|c| c.as_os_str() == "..") {
            return Err(materialization_err(
                MaterializationCode::UnsafeBundleMember,
                format!("archive member path is not allowed: {name}"),
            ));
        }
        let target = destination_root.join(member);
        Ok(target)
    };

    let mut file = std::fs::File::open(archive)?;
    let mut magic = [0u8; 4];
    use std::io::Read;
    let read = file.read(&mut magic).unwrap_or(0);
    let is_zip = read >= 2 && &magic[0..2] == b"PK";

    if is_zip {
        let file = std::fs::File::open(archive)?;
        let mut zip = zip::ZipArchive::new(file)
            .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
            let name = entry.name().to_string();
            if name.is_empty() {
                continue;
            }
            const S_IFLNK: u32 = 0o120000;
            if entry.unix_mode().map(|mode| mode & 0o170000 == S_IFLNK).unwrap_or(false) {
                return Err(materialization_err(
                    MaterializationCode::UnsafeBundleMember,
                    format!("archive member symlinks are not allowed: {name}"),
                ));
            }
            let target = validate_member(&name)?;
            if entry.is_dir() {
                std::fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&target)?;
            std::io::copy(&mut entry, &mut out)?;
        }
        return Ok(());
    }

    let opener = || -> std::io::Result<tar::Archive<Box<dyn Read>>> {
        let raw = std::fs::File::open(archive)?;
        if magic[0..2] == [0x1f, 0x8b] {
            Ok(tar::Archive::new(Box::new(flate2::read::GzDecoder::new(raw))))
        } else {
            Ok(tar::Archive::new(Box::new(raw)))
        }
    };
    let mut archive_reader = opener().map_err(|e| {
        materialization_err(
            MaterializationCode::UnsupportedBundle,
            format!("skill bundle is not a valid zip/tar archive: {archive:?} ({e})"),
        )
    })?;
    let entries = archive_reader
        .entries()
        .map_err(|e| materialization_err(MaterializationCode::UnsupportedBundle, format!("{e}")))?;
    for entry in entries {
        let mut entry = entry
            .map_err(|e| materialization_err(MaterializationCode::UnsupportedBundle, format!("{e}")))?;
        let path = entry.path().map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
        let name = path.to_string_lossy().to_string();
        if name.is_empty() {
            continue;
        }
        let header = entry.header();
        if header.entry_type().is_symlink()
            || header.entry_type().is_hard_link()
            || header.entry_type().is_block_special()
            || header.entry_type().is_character_special()
        {
            return Err(materialization_err(
                MaterializationCode::UnsafeBundleMember,
                format!("archive member link/device entries are not allowed: {name}"),
            ));
        }
        let target = validate_member(&name)?;
        if header.entry_type().is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunSkillSelection, SelectionSource};

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("moonmind-skills-mat-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn materializes_builtin_speckit_and_links_workspace() {
        let run_root = tempdir();
        let cache_root = tempdir();
        let selection = RunSkillSelection {
            run_id: "run-1".to_string(),
            selection_source: SelectionSource::GlobalDefault,
            skills: vec![ResolvedSkill {
                skill_name: "speckit".to_string(),
                version: "local".to_string(),
                source_uri: "builtin://speckit".to_string(),
                content_hash: None,
                signature: None,
            }],
        };

        let materializer = SkillMaterializer::new().unwrap();
        let workspace = materializer
            .materialize_run_skill_workspace(&selection, &run_root, &cache_root, false)
            .await
            .unwrap();

        assert_eq!(workspace.skills.len(), 1);
        assert!(workspace.links.agents_skills_path.is_symlink());
        assert!(workspace.links.gemini_skills_path.is_symlink());
        let active = run_root.join("skills_active").join("speckit");
        assert!(active.is_symlink());

        std::fs::remove_dir_all(&run_root).ok();
        std::fs::remove_dir_all(&cache_root).ok();
    }

    #[tokio::test]
    async fn rejects_duplicate_skill_names() {
        let run_root = tempdir();
        let cache_root = tempdir();
        let dup = ResolvedSkill {
            skill_name: "speckit".to_string(),
            version: "local".to_string(),
            source_uri: "builtin://speckit".to_string(),
            content_hash: None,
            signature: None,
        };
        let selection = RunSkillSelection {
            run_id: "run-1".to_string(),
            selection_source: SelectionSource::GlobalDefault,
            skills: vec![dup.clone(), dup],
        };

        let materializer = SkillMaterializer::new().unwrap();
        let err = materializer
            .materialize_run_skill_workspace(&selection, &run_root, &cache_root, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Materialization {
                code: MaterializationCode::DuplicateSkillName,
                ..
            }
        ));

        std::fs::remove_dir_all(&run_root).ok();
        std::fs::remove_dir_all(&cache_root).ok();
    }

    #[tokio::test]
    async fn requires_signature_when_strict_flag_is_set() {
        let run_root = tempdir();
        let cache_root = tempdir();
        let selection = RunSkillSelection {
            run_id: "run-1".to_string(),
            selection_source: SelectionSource::GlobalDefault,
            skills: vec![ResolvedSkill {
                skill_name: "speckit".to_string(),
                version: "local".to_string(),
                source_uri: "builtin://speckit".to_string(),
                content_hash: None,
                signature: None,
            }],
        };

        let materializer = SkillMaterializer::new().unwrap();
        let err = materializer
            .materialize_run_skill_workspace(&selection, &run_root, &cache_root, true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Materialization {
                code: MaterializationCode::SignatureMissing,
                ..
            }
        ));

        std::fs::remove_dir_all(&run_root).ok();
        std::fs::remove_dir_all(&cache_root).ok();
    }

    #[test]
    fn rejects_addresses_outside_the_public_range() {
        assert!(!is_public_address("127.0.0.1".parse().unwrap()));
        assert!(!is_public_address("10.0.0.5".parse().unwrap()));
        assert!(!is_public_address("169.254.1.1".parse().unwrap()));
        assert!(!is_public_address("::1".parse().unwrap()));
        assert!(is_public_address("93.184.216.34".parse().unwrap()));
    }
}
