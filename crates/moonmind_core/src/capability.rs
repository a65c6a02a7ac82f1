//! Capability token helpers (spec glossary: "a lowercase token ... match is subset
//! containment").

use std::collections::BTreeSet;

/// Lowercase, trim, dedupe while preserving first-seen order (used for
/// `requiredCapabilities` lists, where order is part of the normalized, round-trippable
/// payload — spec §8 "ordered `requiredCapabilities`").
pub fn normalize_capabilities<I, S>(tokens: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for token in tokens {
        let normalized = token.as_ref().trim().to_lowercase();
        if normalized.is_empty() {
            continue;
        }
        if seen.insert(normalized.clone()) {
            out.push(normalized);
        }
    }
    out
}

/// `required ⊆ available`, deny-by-default: an empty `required` set is never satisfied
/// (spec §4.1 step 2, §8 "Claim with empty requiredCapabilities ... never selected").
pub fn subset_of(required: &[String], available: &[String]) -> bool {
    if required.is_empty() {
        return false;
    }
    let available: BTreeSet<&str> = available.iter().map(|s| s.as_str()).collect();
    required.iter().all(|r| available.contains(r.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_dedupes_and_lowercases() {
        let out = normalize_capabilities(["Codex", "git", "CODEX", " git "]);
        assert_eq!(out, vec!["codex".to_string(), "git".to_string()]);
    }

    #[test]
    fn empty_required_never_satisfied() {
        assert!(!subset_of(&[], &["codex".to_string()]));
    }

    #[test]
    fn subset_containment() {
        let required = vec!["codex".to_string(), "git".to_string()];
        let available = vec!["git".to_string(), "codex".to_string(), "gh".to_string()];
        assert!(subset_of(&required, &available));
        let missing = vec!["docker".to_string()];
        assert!(!subset_of(&missing, &available));
    }
}
