//! Deduplication key/hash computation (spec §4.7).
//!
//! Grounded on `original_source/moonmind/workflows/task_proposals/service.py`'s
//! `_slugify_title`/`_compute_dedup_fields`: same slug pattern, same
//! `"{repository_lc}:{slug}"` key shape, same sha256 hex digest.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

const DEDUP_KEY_MAX_CHARS: usize = 512;

fn slug_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").unwrap())
}

/// Lowercase `title`, collapse runs of non-alphanumeric characters to a single `-`,
/// and trim leading/trailing `-`. Falls back to `"untitled"` when nothing survives.
pub fn slugify_title(title: &str) -> String {
    let lowered = title.to_lowercase();
    let collapsed = slug_pattern().replace_all(&lowered, "-");
    let trimmed = collapsed.trim_matches('-');
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `dedup_key = "{repository_lc}:{slugify(title)}"`, `dedup_hash = sha256(dedup_key)`.
pub fn compute_dedup_fields(repository: &str, title: &str) -> (String, String) {
    let repo = repository.trim().to_lowercase();
    let repo = if repo.is_empty() { "unknown".to_string() } else { repo };
    let slug = slugify_title(title);
    let key: String = format!("{repo}:{slug}")
        .chars()
        .take(DEDUP_KEY_MAX_CHARS)
        .collect();
    let hash = hex::encode(Sha256::digest(key.as_bytes()));
    (key, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify_title("Fix   the Bug!!  "), "fix-the-bug");
    }

    #[test]
    fn slugify_falls_back_to_untitled() {
        assert_eq!(slugify_title("***"), "untitled");
    }

    #[test]
    fn dedup_fields_are_deterministic() {
        let (key_a, hash_a) = compute_dedup_fields("Moon/Mind", "Fix the bug");
        let (key_b, hash_b) = compute_dedup_fields("moon/mind", "fix the BUG");
        assert_eq!(key_a, key_b);
        assert_eq!(hash_a, hash_b);
        assert_eq!(key_a, "moon/mind:fix-the-bug");
        assert_eq!(hash_a.len(), 64);
    }

    #[test]
    fn empty_repository_falls_back_to_unknown() {
        let (key, _) = compute_dedup_fields("  ", "Title");
        assert!(key.starts_with("unknown:"));
    }
}
