//! Mount-anchored path containment
//!
//! Client paths are absolute under the workspace mount point (typically
//! `/workspace`). Containment is enforced in three layers: literal `..`
//! segments are rejected outright, the lexically normalized path must
//! stay under the mount, and the resolved host path must not escape the
//! workspace root through symlinks.

use std::path::{Component, Path, PathBuf};

use super::errors::{WorkspaceError, WorkspaceResult};

/// A validated path inside one container's workspace
#[derive(Debug, Clone)]
pub struct WorkspacePath {
    /// Host-side workspace root
    root: PathBuf,
    /// Resolved host path
    resolved: PathBuf,
    /// Path as the client names it, `/workspace/...`
    client_path: String,
}

impl WorkspacePath {
    /// Validate a client path against a workspace root.
    pub fn resolve(root: &Path, mount: &str, client_path: &str) -> WorkspaceResult<Self> {
        let trimmed = client_path.trim();

        // Literal parent-directory segments are rejected before any
        // normalization
        if Path::new(trimmed)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(WorkspaceError::PathViolation(format!(
                "'{}' contains a parent-directory segment",
                client_path
            )));
        }

        let relative = if trimmed == mount || trimmed == format!("{}/", mount) {
            ""
        } else {
            match trimmed.strip_prefix(&format!("{}/", mount)) {
                Some(rest) => rest,
                None => {
                    return Err(WorkspaceError::PathViolation(format!(
                        "'{}' is outside {}",
                        client_path, mount
                    )))
                }
            }
        };

        let mut clean = PathBuf::new();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(c) => clean.push(c),
                Component::CurDir => {}
                _ => {
                    return Err(WorkspaceError::PathViolation(format!(
                        "'{}' is not a plain workspace path",
                        client_path
                    )))
                }
            }
        }

        let resolved = root.join(&clean);
        verify_symlink_containment(root, &resolved)?;

        let client_path = if clean.as_os_str().is_empty() {
            mount.to_string()
        } else {
            format!("{}/{}", mount, clean.to_string_lossy())
        };

        Ok(Self {
            root: root.to_path_buf(),
            resolved,
            client_path,
        })
    }

    /// Host path the operation targets
    pub fn resolved(&self) -> &Path {
        &self.resolved
    }

    /// Workspace root this path belongs to
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path as the client names it
    pub fn client_path(&self) -> &str {
        &self.client_path
    }

    pub fn file_name(&self) -> Option<&str> {
        self.resolved.file_name().and_then(|s| s.to_str())
    }
}

impl AsRef<Path> for WorkspacePath {
    fn as_ref(&self) -> &Path {
        &self.resolved
    }
}

/// Walk to the deepest existing ancestor of `resolved` and verify its
/// canonical form stays under the canonical root. This catches symlinks
/// anywhere along the path whose targets leave the workspace.
fn verify_symlink_containment(root: &Path, resolved: &Path) -> WorkspaceResult<()> {
    let canonical_root = root.canonicalize().map_err(|e| {
        WorkspaceError::PathViolation(format!("workspace root unavailable: {}", e))
    })?;

    let mut probe = resolved.to_path_buf();
    loop {
        if probe.exists() {
            let canonical = probe.canonicalize()?;
            if canonical.starts_with(&canonical_root) {
                return Ok(());
            }
            return Err(WorkspaceError::PathViolation(
                "path resolves outside the workspace".to_string(),
            ));
        }
        if !probe.pop() {
            // Nothing along the path exists yet; the lexical check above
            // already bounded it to the root
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MOUNT: &str = "/workspace";

    #[test]
    fn test_plain_paths_resolve() {
        let temp = TempDir::new().unwrap();
        let p = WorkspacePath::resolve(temp.path(), MOUNT, "/workspace/a/b.txt").unwrap();
        assert_eq!(p.resolved(), temp.path().join("a/b.txt"));
        assert_eq!(p.client_path(), "/workspace/a/b.txt");

        let root = WorkspacePath::resolve(temp.path(), MOUNT, "/workspace").unwrap();
        assert_eq!(root.resolved(), temp.path());
        assert_eq!(root.client_path(), "/workspace");
    }

    #[test]
    fn test_parent_segments_rejected() {
        let temp = TempDir::new().unwrap();
        for bad in [
            "/workspace/../etc/passwd",
            "/workspace/a/../../etc",
            "/workspace/..",
            "../workspace/a",
        ] {
            let err = WorkspacePath::resolve(temp.path(), MOUNT, bad).unwrap_err();
            assert!(matches!(err, WorkspaceError::PathViolation(_)), "{}", bad);
        }
    }

    #[test]
    fn test_paths_outside_mount_rejected() {
        let temp = TempDir::new().unwrap();
        for bad in ["/etc/passwd", "relative/path", "/workspaces/x", ""] {
            let err = WorkspacePath::resolve(temp.path(), MOUNT, bad).unwrap_err();
            assert!(matches!(err, WorkspaceError::PathViolation(_)), "{:?}", bad);
        }
    }

    #[test]
    fn test_current_dir_segments_collapse() {
        let temp = TempDir::new().unwrap();
        let p = WorkspacePath::resolve(temp.path(), MOUNT, "/workspace/./a/./b").unwrap();
        assert_eq!(p.resolved(), temp.path().join("a/b"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let temp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("leak")).unwrap();

        let err =
            WorkspacePath::resolve(temp.path(), MOUNT, "/workspace/leak/secret").unwrap_err();
        assert!(matches!(err, WorkspaceError::PathViolation(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_internal_symlink_allowed() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("real")).unwrap();
        std::os::unix::fs::symlink("real", temp.path().join("alias")).unwrap();

        let p = WorkspacePath::resolve(temp.path(), MOUNT, "/workspace/alias/f.txt").unwrap();
        assert!(p.resolved().starts_with(temp.path()));
    }
}
