//! Virtual-to-physical path translation.
//!
//! Agents only ever see two virtual roots:
//! - `/mnt/user-data` (with `workspace`, `uploads`, `outputs`), one tree per thread
//! - `/mnt/skills`, a single shared read-only directory
//!
//! The physical side depends on the backend. Locally the roots map onto host
//! directories; inside a container or Pod they are mount points, so the
//! mapping is the identity. Both layouts share the same normalisation so a
//! path behaves identically on every backend.

use std::path::PathBuf;

use super::{SandboxError, SandboxResult};
use crate::paths::{validate_thread_id, Paths};

/// Virtual root for per-thread user data.
pub(crate) const USER_DATA_ROOT: &str = "/mnt/user-data";

/// Virtual root for the shared skills directory.
pub(crate) const SKILLS_ROOT: &str = "/mnt/skills";

/// Characters that end a path token inside a shell command.
fn ends_token(c: char) -> bool {
    c.is_whitespace() || matches!(c, '"' | '\'' | ';' | '&' | '|' | '<' | '>' | '(' | ')')
}

/// Which recognised root a virtual path falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VirtualRoot {
    UserData,
    Skills,
}

impl VirtualRoot {
    fn virtual_prefix(self) -> &'static str {
        match self {
            Self::UserData => USER_DATA_ROOT,
            Self::Skills => SKILLS_ROOT,
        }
    }

    /// Whether writes under this root are allowed.
    pub fn is_writable(self) -> bool {
        matches!(self, Self::UserData)
    }
}

/// Where the virtual roots live physically.
#[derive(Debug, Clone)]
pub(crate) enum PathLayout {
    /// Host directories under a base dir plus a shared skills directory.
    Host { paths: Paths, skills_dir: PathBuf },
    /// Roots are mounted at their virtual location (containers, Pods).
    Mounted,
}

/// A virtual path resolved to its physical location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedPath {
    /// Physical path on the backend.
    pub physical: String,
    /// Recognised root, or `None` for pass-through paths.
    pub root: Option<VirtualRoot>,
}

/// Translates between agent-visible and backend-physical paths.
#[derive(Debug, Clone)]
pub(crate) struct VirtualPathTranslator {
    layout: PathLayout,
}

impl VirtualPathTranslator {
    pub fn new(layout: PathLayout) -> Self {
        Self { layout }
    }

    /// Identity layout used by container-backed sandboxes.
    pub fn mounted() -> Self {
        Self::new(PathLayout::Mounted)
    }

    /// Physical directory backing a virtual root for `thread_id`.
    fn physical_root(&self, root: VirtualRoot, thread_id: &str) -> SandboxResult<String> {
        match (&self.layout, root) {
            (PathLayout::Mounted, root) => Ok(root.virtual_prefix().to_string()),
            (PathLayout::Host { paths, .. }, VirtualRoot::UserData) => {
                Ok(paths.user_data_dir(thread_id)?.display().to_string())
            }
            (PathLayout::Host { skills_dir, .. }, VirtualRoot::Skills) => {
                Ok(skills_dir.display().to_string())
            }
        }
    }

    /// Resolves a virtual path, rejecting traversal out of its root.
    ///
    /// Paths outside the recognised roots are returned unchanged.
    pub fn resolve(&self, virtual_path: &str, thread_id: &str) -> SandboxResult<ResolvedPath> {
        validate_thread_id(thread_id)?;

        let Some((root, rest)) = split_root(virtual_path) else {
            return Ok(ResolvedPath {
                physical: virtual_path.to_string(),
                root: None,
            });
        };

        let mut resolved: Vec<&str> = Vec::new();
        for segment in rest {
            if segment == ".." {
                if resolved.pop().is_none() {
                    return Err(SandboxError::path_traversal(virtual_path));
                }
            } else {
                resolved.push(segment);
            }
        }

        let mut physical = self.physical_root(root, thread_id)?;
        for segment in &resolved {
            physical.push('/');
            physical.push_str(segment);
        }
        if virtual_path.len() > 1 && virtual_path.ends_with('/') {
            physical.push('/');
        }

        Ok(ResolvedPath {
            physical,
            root: Some(root),
        })
    }

    /// Maps a virtual path to its physical location.
    pub fn to_physical(&self, virtual_path: &str, thread_id: &str) -> SandboxResult<String> {
        Ok(self.resolve(virtual_path, thread_id)?.physical)
    }

    /// Like [`Self::to_physical`] but rejects read-only roots.
    pub fn to_physical_writable(&self, virtual_path: &str, thread_id: &str) -> SandboxResult<String> {
        let resolved = self.resolve(virtual_path, thread_id)?;
        match resolved.root {
            Some(root) if !root.is_writable() => Err(SandboxError::read_only(virtual_path)),
            _ => Ok(resolved.physical),
        }
    }

    /// Maps a physical path back to its virtual form.
    ///
    /// Physical paths outside the mapped roots are returned unchanged.
    pub fn to_virtual(&self, physical_path: &str, thread_id: &str) -> String {
        for root in [VirtualRoot::UserData, VirtualRoot::Skills] {
            let Ok(physical_root) = self.physical_root(root, thread_id) else {
                continue;
            };
            if let Some(suffix) = strip_root(physical_path, &physical_root) {
                return format!("{}{suffix}", root.virtual_prefix());
            }
        }
        physical_path.to_string()
    }

    /// Rewrites every virtual path token in a shell command line.
    pub fn translate_command(&self, command: &str, thread_id: &str) -> SandboxResult<String> {
        if !command.contains("/mnt/") {
            return Ok(command.to_string());
        }

        let mut out = String::with_capacity(command.len());
        let mut last = 0;
        for (start, _) in command.match_indices("/mnt/") {
            if start < last {
                continue;
            }
            let preceded_by_path = command[..start]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'));
            if preceded_by_path {
                continue;
            }
            let end = command[start..]
                .find(ends_token)
                .map_or(command.len(), |len| start + len);
            let token = &command[start..end];
            if split_root(token).is_none() {
                continue;
            }
            out.push_str(&command[last..start]);
            out.push_str(&self.to_physical(token, thread_id)?);
            last = end;
        }
        out.push_str(&command[last..]);
        Ok(out)
    }

    /// Replaces physical roots in backend output with their virtual form.
    pub fn virtualize_output(&self, text: &str, thread_id: &str) -> String {
        if matches!(self.layout, PathLayout::Mounted) {
            return text.to_string();
        }
        let mut out = text.to_string();
        for root in [VirtualRoot::UserData, VirtualRoot::Skills] {
            if let Ok(physical_root) = self.physical_root(root, thread_id) {
                out = out.replace(&physical_root, root.virtual_prefix());
            }
        }
        out
    }
}

/// Splits a virtual path into its root and the remaining normalised segments.
///
/// Empty and `.` segments are dropped; `..` is kept for the caller to resolve.
fn split_root(path: &str) -> Option<(VirtualRoot, Vec<&str>)> {
    if !path.starts_with('/') {
        return None;
    }
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    let root = match segments.as_slice() {
        ["mnt", "user-data", ..] => VirtualRoot::UserData,
        ["mnt", "skills", ..] => VirtualRoot::Skills,
        _ => return None,
    };
    Some((root, segments[2..].to_vec()))
}

/// Returns the part of `path` after `root` if `root` is a whole-segment prefix.
fn strip_root<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    let suffix = path.strip_prefix(root)?;
    (suffix.is_empty() || suffix.starts_with('/')).then_some(suffix)
}
