//! Workspace file operations

use std::path::Path;
use std::time::SystemTime;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::archive::{self, ImportSummary};
use super::errors::{WorkspaceError, WorkspaceResult};
use super::path::WorkspacePath;

/// Bytes of leading content folded into the ETag.
const ETAG_PREFIX_BYTES: u64 = 64 * 1024;

/// Result of a read
#[derive(Debug)]
pub struct ReadFile {
    pub content: Vec<u8>,
    pub size: u64,
    pub etag: String,
    pub modified_ms: i64,
    pub mime_type: String,
}

/// Result of a write
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub etag: String,
    pub size: u64,
}

/// One write inside a batch
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub path: String,
    pub content: Vec<u8>,
    pub if_match_etag: Option<String>,
}

/// Stat-level metadata for one entry
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub name: String,
    /// Client-visible path under the mount
    pub path: String,
    pub size: u64,
    pub is_directory: bool,
    pub is_file: bool,
    pub is_symlink: bool,
    pub mode: u32,
    pub modified_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub mime_type: String,
}

/// Filesystem gateway for container workspaces. Stateless apart from the
/// mount path; callers pass the per-container workspace root.
pub struct WorkspaceGateway {
    mount_path: String,
}

impl WorkspaceGateway {
    pub fn new(mount_path: impl Into<String>) -> Self {
        Self {
            mount_path: mount_path.into(),
        }
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    /// Validate a client path against a workspace root.
    pub fn resolve(&self, root: &Path, client_path: &str) -> WorkspaceResult<WorkspacePath> {
        WorkspacePath::resolve(root, &self.mount_path, client_path)
    }

    /// Read a file, binary-safe.
    pub async fn read(&self, root: &Path, client_path: &str) -> WorkspaceResult<ReadFile> {
        let path = self.resolve(root, client_path)?;

        let metadata = fs::metadata(path.resolved())
            .await
            .map_err(|_| WorkspaceError::NotFound(client_path.to_string()))?;
        if metadata.is_dir() {
            return Err(WorkspaceError::IsDirectory(format!(
                "'{}' is a directory",
                client_path
            )));
        }

        let content = fs::read(path.resolved()).await?;
        let mtime_ns = mtime_nanos(&metadata);
        let prefix_len = (ETAG_PREFIX_BYTES as usize).min(content.len());
        let etag = compute_etag(metadata.len(), mtime_ns, &content[..prefix_len]);

        Ok(ReadFile {
            size: content.len() as u64,
            etag,
            modified_ms: (mtime_ns / 1_000_000) as i64,
            mime_type: guess_mime(path.file_name().unwrap_or_default()),
            content,
        })
    }

    /// Write a file atomically: content lands under a staged name in the
    /// same directory and is renamed into place. With `if_match_etag`,
    /// the write only happens when the current ETag matches.
    pub async fn write(
        &self,
        root: &Path,
        client_path: &str,
        content: &[u8],
        if_match_etag: Option<&str>,
    ) -> WorkspaceResult<WriteOutcome> {
        let path = self.resolve(root, client_path)?;

        if path.resolved().is_dir() {
            return Err(WorkspaceError::IsDirectory(format!(
                "'{}' is a directory",
                client_path
            )));
        }

        if let Some(expected) = if_match_etag {
            let actual = match self.etag_of(path.resolved()).await? {
                Some(etag) => etag,
                None => String::new(),
            };
            if actual != expected {
                return Err(WorkspaceError::EtagConflict {
                    path: client_path.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        if let Some(parent) = path.resolved().parent() {
            fs::create_dir_all(parent).await?;
        }

        let staged = staged_name(path.resolved());
        fs::write(&staged, content).await?;
        if let Err(e) = fs::rename(&staged, path.resolved()).await {
            let _ = fs::remove_file(&staged).await;
            return Err(e.into());
        }

        let etag = self
            .etag_of(path.resolved())
            .await?
            .unwrap_or_default();

        debug!("wrote {} bytes to {}", content.len(), path.client_path());
        Ok(WriteOutcome {
            etag,
            size: content.len() as u64,
        })
    }

    /// Grouped writes: every ETag precondition is checked before any
    /// content is staged, and a failure while staging or renaming rolls
    /// the staged files back.
    pub async fn write_batch(
        &self,
        root: &Path,
        ops: &[WriteOp],
    ) -> WorkspaceResult<Vec<WriteOutcome>> {
        // Validate paths and preconditions up front
        let mut resolved = Vec::with_capacity(ops.len());
        for op in ops {
            let path = self.resolve(root, &op.path)?;
            if path.resolved().is_dir() {
                return Err(WorkspaceError::IsDirectory(format!(
                    "'{}' is a directory",
                    op.path
                )));
            }
            if let Some(expected) = &op.if_match_etag {
                let actual = self.etag_of(path.resolved()).await?.unwrap_or_default();
                if &actual != expected {
                    return Err(WorkspaceError::EtagConflict {
                        path: op.path.clone(),
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
            resolved.push(path);
        }

        // Stage everything, then rename everything
        let mut staged = Vec::with_capacity(ops.len());
        for (op, path) in ops.iter().zip(&resolved) {
            if let Some(parent) = path.resolved().parent() {
                if let Err(e) = fs::create_dir_all(parent).await {
                    rollback(&staged).await;
                    return Err(e.into());
                }
            }
            let tmp = staged_name(path.resolved());
            if let Err(e) = fs::write(&tmp, &op.content).await {
                rollback(&staged).await;
                return Err(e.into());
            }
            staged.push(tmp);
        }

        for (path, tmp) in resolved.iter().zip(&staged) {
            if let Err(e) = fs::rename(tmp, path.resolved()).await {
                rollback(&staged).await;
                return Err(e.into());
            }
        }

        let mut outcomes = Vec::with_capacity(ops.len());
        for (op, path) in ops.iter().zip(&resolved) {
            let etag = self.etag_of(path.resolved()).await?.unwrap_or_default();
            outcomes.push(WriteOutcome {
                etag,
                size: op.content.len() as u64,
            });
        }
        Ok(outcomes)
    }

    /// Delete a file or directory. Directories require `recursive`.
    pub async fn delete(
        &self,
        root: &Path,
        client_path: &str,
        recursive: bool,
    ) -> WorkspaceResult<()> {
        let path = self.resolve(root, client_path)?;

        let metadata = fs::symlink_metadata(path.resolved())
            .await
            .map_err(|_| WorkspaceError::NotFound(client_path.to_string()))?;

        if metadata.is_dir() {
            if !recursive {
                return Err(WorkspaceError::IsDirectory(format!(
                    "'{}' is a directory; pass recursive=true",
                    client_path
                )));
            }
            fs::remove_dir_all(path.resolved()).await?;
        } else {
            fs::remove_file(path.resolved()).await?;
        }

        debug!("deleted {}", path.client_path());
        Ok(())
    }

    /// Stat one entry.
    pub async fn stat(&self, root: &Path, client_path: &str) -> WorkspaceResult<EntryInfo> {
        let path = self.resolve(root, client_path)?;

        let metadata = fs::symlink_metadata(path.resolved())
            .await
            .map_err(|_| WorkspaceError::NotFound(client_path.to_string()))?;

        self.entry_info(&path, &metadata).await
    }

    /// List a directory with stat-level metadata, directories first.
    pub async fn list(&self, root: &Path, client_path: &str) -> WorkspaceResult<Vec<EntryInfo>> {
        let path = self.resolve(root, client_path)?;

        let metadata = fs::metadata(path.resolved())
            .await
            .map_err(|_| WorkspaceError::NotFound(client_path.to_string()))?;
        if !metadata.is_dir() {
            return Err(WorkspaceError::NotADirectory(format!(
                "'{}' is not a directory",
                client_path
            )));
        }

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(path.resolved()).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let child_path = format!("{}/{}", path.client_path().trim_end_matches('/'), name);
            let child = match self.resolve(root, &child_path) {
                Ok(p) => p,
                // Entries that escape through symlinks are not listed
                Err(_) => continue,
            };
            let metadata = match fs::symlink_metadata(child.resolved()).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            entries.push(self.entry_info(&child, &metadata).await?);
        }

        entries.sort_by(|a, b| match (a.is_directory, b.is_directory) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        Ok(entries)
    }

    /// Export a subtree as a (optionally gzipped) tar archive written to
    /// a spool file; the caller streams and unlinks it.
    pub async fn export_tar(
        &self,
        root: &Path,
        client_path: &str,
        include_globs: &[String],
        exclude_globs: &[String],
        gzip: bool,
    ) -> WorkspaceResult<std::path::PathBuf> {
        let path = self.resolve(root, client_path)?;
        if !path.resolved().is_dir() {
            return Err(WorkspaceError::NotADirectory(format!(
                "'{}' is not a directory",
                client_path
            )));
        }
        archive::export(path.resolved().to_path_buf(), include_globs.to_vec(), exclude_globs.to_vec(), gzip)
            .await
    }

    /// Import a tar archive under a workspace directory; all-or-nothing
    /// via a staging directory.
    pub async fn import_tar(
        &self,
        root: &Path,
        dest_path: &str,
        data: bytes::Bytes,
    ) -> WorkspaceResult<ImportSummary> {
        let dest = self.resolve(root, dest_path)?;
        archive::import(dest.resolved().to_path_buf(), data).await
    }

    async fn entry_info(
        &self,
        path: &WorkspacePath,
        metadata: &std::fs::Metadata,
    ) -> WorkspaceResult<EntryInfo> {
        let name = path.file_name().unwrap_or_default().to_string();
        let mtime_ns = mtime_nanos(metadata);

        let etag = if metadata.is_file() {
            self.etag_of(path.resolved()).await?
        } else {
            None
        };

        let mime_type = if metadata.is_dir() {
            "inode/directory".to_string()
        } else {
            guess_mime(&name)
        };

        Ok(EntryInfo {
            name,
            path: path.client_path().to_string(),
            size: metadata.len(),
            is_directory: metadata.is_dir(),
            is_file: metadata.is_file(),
            is_symlink: metadata.file_type().is_symlink(),
            mode: get_mode(metadata),
            modified_ms: (mtime_ns / 1_000_000) as i64,
            etag,
            mime_type,
        })
    }

    /// Current ETag of a file, or `None` when it does not exist.
    ///
    /// The ETag is a fixed function of size, mtime and a content-prefix
    /// hash, so clients may memoize it for the life of the server.
    pub async fn etag_of(&self, path: &Path) -> WorkspaceResult<Option<String>> {
        let metadata = match fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            _ => return Ok(None),
        };

        let file = fs::File::open(path).await?;
        let mut prefix = Vec::with_capacity(ETAG_PREFIX_BYTES.min(metadata.len()) as usize);
        file.take(ETAG_PREFIX_BYTES).read_to_end(&mut prefix).await?;

        Ok(Some(compute_etag(metadata.len(), mtime_nanos(&metadata), &prefix)))
    }
}

fn compute_etag(size: u64, mtime_ns: u128, prefix: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prefix);
    let digest = hasher.finalize();
    format!("{:x}-{:x}-{}", size, mtime_ns, hex::encode(&digest[..8]))
}

fn mtime_nanos(metadata: &std::fs::Metadata) -> u128 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn guess_mime(name: &str) -> String {
    mime_guess::from_path(name).first_or_octet_stream().to_string()
}

fn staged_name(target: &Path) -> std::path::PathBuf {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".devbench-write-{}", &id[..8]))
}

async fn rollback(staged: &[std::path::PathBuf]) {
    for tmp in staged {
        let _ = fs::remove_file(tmp).await;
    }
}

/// Get file mode from metadata
#[cfg(unix)]
fn get_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn get_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gateway() -> WorkspaceGateway {
        WorkspaceGateway::new("/workspace")
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let temp = TempDir::new().unwrap();
        let gw = gateway();

        let written = gw
            .write(temp.path(), "/workspace/dir/hello.txt", b"hi there", None)
            .await
            .unwrap();
        assert_eq!(written.size, 8);

        let read = gw.read(temp.path(), "/workspace/dir/hello.txt").await.unwrap();
        assert_eq!(read.content, b"hi there");
        assert_eq!(read.etag, written.etag);
        assert_eq!(read.mime_type, "text/plain");

        let stat = gw.stat(temp.path(), "/workspace/dir/hello.txt").await.unwrap();
        assert_eq!(stat.etag.as_deref(), Some(written.etag.as_str()));
        assert_eq!(stat.size, 8);
    }

    #[tokio::test]
    async fn test_binary_content_is_preserved() {
        let temp = TempDir::new().unwrap();
        let gw = gateway();
        let blob: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();

        gw.write(temp.path(), "/workspace/blob.bin", &blob, None)
            .await
            .unwrap();
        let read = gw.read(temp.path(), "/workspace/blob.bin").await.unwrap();
        assert_eq!(read.content, blob);
        assert_eq!(read.mime_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn test_etag_conflict_does_not_mutate() {
        let temp = TempDir::new().unwrap();
        let gw = gateway();

        let first = gw
            .write(temp.path(), "/workspace/x", b"A", None)
            .await
            .unwrap();

        let err = gw
            .write(temp.path(), "/workspace/x", b"B", Some("E0"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::EtagConflict { .. }));

        let read = gw.read(temp.path(), "/workspace/x").await.unwrap();
        assert_eq!(read.content, b"A");
        assert_eq!(read.etag, first.etag);
    }

    #[tokio::test]
    async fn test_matching_etag_allows_write() {
        let temp = TempDir::new().unwrap();
        let gw = gateway();

        let first = gw.write(temp.path(), "/workspace/x", b"A", None).await.unwrap();
        let second = gw
            .write(temp.path(), "/workspace/x", b"BB", Some(&first.etag))
            .await
            .unwrap();
        assert_ne!(first.etag, second.etag);

        let read = gw.read(temp.path(), "/workspace/x").await.unwrap();
        assert_eq!(read.content, b"BB");
    }

    #[tokio::test]
    async fn test_if_match_on_missing_file_conflicts() {
        let temp = TempDir::new().unwrap();
        let gw = gateway();

        let err = gw
            .write(temp.path(), "/workspace/nope", b"B", Some("E1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::EtagConflict { .. }));
        assert!(gw.read(temp.path(), "/workspace/nope").await.is_err());
    }

    #[tokio::test]
    async fn test_no_staging_residue() {
        let temp = TempDir::new().unwrap();
        let gw = gateway();
        gw.write(temp.path(), "/workspace/a.txt", b"abc", None).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_delete_directory_requires_recursive() {
        let temp = TempDir::new().unwrap();
        let gw = gateway();
        gw.write(temp.path(), "/workspace/d/f", b"x", None).await.unwrap();

        let err = gw.delete(temp.path(), "/workspace/d", false).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::IsDirectory(_)));

        gw.delete(temp.path(), "/workspace/d", true).await.unwrap();
        assert!(gw.stat(temp.path(), "/workspace/d").await.is_err());
    }

    #[tokio::test]
    async fn test_list_sorted_directories_first() {
        let temp = TempDir::new().unwrap();
        let gw = gateway();
        gw.write(temp.path(), "/workspace/b.txt", b"x", None).await.unwrap();
        gw.write(temp.path(), "/workspace/sub/f", b"x", None).await.unwrap();
        gw.write(temp.path(), "/workspace/a.txt", b"x", None).await.unwrap();

        let entries = gw.list(temp.path(), "/workspace").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["sub", "a.txt", "b.txt"]);
        assert_eq!(entries[0].mime_type, "inode/directory");
        assert_eq!(entries[1].path, "/workspace/a.txt");
    }

    #[tokio::test]
    async fn test_path_violation_before_any_io() {
        let temp = TempDir::new().unwrap();
        let gw = gateway();

        let err = gw
            .read(temp.path(), "/workspace/../etc/passwd")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::PathViolation(_)));
    }

    #[tokio::test]
    async fn test_write_batch_rolls_back_on_stale_etag() {
        let temp = TempDir::new().unwrap();
        let gw = gateway();
        gw.write(temp.path(), "/workspace/x", b"old", None).await.unwrap();

        let ops = vec![
            WriteOp {
                path: "/workspace/new1".into(),
                content: b"n1".to_vec(),
                if_match_etag: None,
            },
            WriteOp {
                path: "/workspace/x".into(),
                content: b"clobber".to_vec(),
                if_match_etag: Some("stale".into()),
            },
        ];

        let err = gw.write_batch(temp.path(), &ops).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::EtagConflict { .. }));

        // Nothing was applied
        assert!(gw.read(temp.path(), "/workspace/new1").await.is_err());
        let read = gw.read(temp.path(), "/workspace/x").await.unwrap();
        assert_eq!(read.content, b"old");
    }

    #[tokio::test]
    async fn test_write_batch_applies_all() {
        let temp = TempDir::new().unwrap();
        let gw = gateway();

        let ops = vec![
            WriteOp {
                path: "/workspace/a".into(),
                content: b"1".to_vec(),
                if_match_etag: None,
            },
            WriteOp {
                path: "/workspace/d/b".into(),
                content: b"2".to_vec(),
                if_match_etag: None,
            },
        ];
        let outcomes = gw.write_batch(temp.path(), &ops).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(gw.read(temp.path(), "/workspace/a").await.unwrap().content, b"1");
        assert_eq!(gw.read(temp.path(), "/workspace/d/b").await.unwrap().content, b"2");
    }
}
