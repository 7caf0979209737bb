//! Write-permission boundaries derived from agent classes.
//!
//! Each permission class maps to a pair of (allowed-roots, disallowed-roots)
//! computed once at registry load and attached to the agent definition.
//! `allows_write_to` is a pure function over lexically normalized paths.

use std::path::{Component, Path, PathBuf};

use crate::core::types::AgentClass;

/// Immutable write-path constraints for one agent.
///
/// Roots are path prefixes relative to the target repository root, with a
/// trailing separator implied (`var/registry/` allows `var/registry/x.json`
/// but not `var/registry2/x.json`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionSet {
    can_write: bool,
    allowed: Vec<PathBuf>,
    disallowed: Vec<PathBuf>,
}

impl PermissionSet {
    /// Default constraints for a permission class.
    pub fn for_class(class: AgentClass) -> PermissionSet {
        match class {
            AgentClass::ReadOnlyScan | AgentClass::PlanningSynthesis => PermissionSet {
                can_write: false,
                allowed: Vec::new(),
                disallowed: Vec::new(),
            },
            AgentClass::RegistryState => PermissionSet {
                can_write: true,
                allowed: roots(&["var/registry", "var/audit"]),
                disallowed: Vec::new(),
            },
            AgentClass::WriteGated => PermissionSet {
                can_write: true,
                allowed: roots(&["prompts/agents", "var/artifacts", "var/cache"]),
                disallowed: roots(&["src", "configs", "docs", "tests", "scripts", "assets"]),
            },
            AgentClass::ControlPlane => PermissionSet {
                can_write: true,
                allowed: roots(&["var", "prompts/agents"]),
                disallowed: Vec::new(),
            },
        }
    }

    /// Overlay file-declared path lists on top of the class defaults.
    ///
    /// A declared list replaces the corresponding default list; an absent
    /// list keeps the default. Declared lists never grant write access to a
    /// class that cannot write.
    pub fn overlay(mut self, allowed: Option<Vec<String>>, disallowed: Option<Vec<String>>) -> Self {
        if let Some(allowed) = allowed {
            self.allowed = roots_owned(allowed);
        }
        if let Some(disallowed) = disallowed {
            self.disallowed = roots_owned(disallowed);
        }
        self
    }

    /// True iff the agent may write to `target`.
    ///
    /// `target` may be absolute or relative to `repo_root`. The check is
    /// lexical: `.` and `..` components are resolved without touching the
    /// filesystem, then the path must fall under `repo_root`, under at least
    /// one allowed root, and under none of the disallowed roots.
    pub fn allows_write_to(&self, repo_root: &Path, target: &Path) -> bool {
        if !self.can_write {
            return false;
        }
        let root = normalize(repo_root);
        let absolute = if target.is_absolute() {
            normalize(target)
        } else {
            normalize(&root.join(target))
        };
        let Ok(relative) = absolute.strip_prefix(&root) else {
            return false;
        };
        if self.disallowed.iter().any(|d| relative.starts_with(d)) {
            return false;
        }
        self.allowed.iter().any(|a| relative.starts_with(a))
    }

    pub fn allowed_roots(&self) -> &[PathBuf] {
        &self.allowed
    }

    pub fn disallowed_roots(&self) -> &[PathBuf] {
        &self.disallowed
    }
}

/// Resolve `.` and `..` components lexically, without filesystem access.
///
/// Paths under scrutiny may not exist yet (agents declare writes before
/// performing them), so `canonicalize` is not an option here.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn roots(prefixes: &[&str]) -> Vec<PathBuf> {
    prefixes.iter().map(PathBuf::from).collect()
}

fn roots_owned(prefixes: Vec<String>) -> Vec<PathBuf> {
    prefixes
        .into_iter()
        .map(|p| PathBuf::from(p.trim_end_matches('/')))
        .collect()
}
