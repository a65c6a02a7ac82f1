//! Skill Resolver & Materializer: per-run skill selection, immutable content-hash
//! cache, and run workspace symlink adapters (spec §4.9).

pub mod materializer;
pub mod resolver;
pub mod types;
pub mod workspace_links;

pub use materializer::SkillMaterializer;
pub use resolver::{
    resolve_run_skill_selection, validate_skill_name, SkillPolicyMode, SkillResolverConfig,
    SkillSelectionEntry,
};
pub use types::{
    MaterializedSkill, MaterializedSkillWorkspace, ResolvedSkill, RunSkillSelection,
    SelectionSource, SkillWorkspaceLinks,
};
pub use workspace_links::{ensure_shared_skill_links, validate_shared_skill_links};
