//! Tar export and import for workspace subtrees
//!
//! Export walks the tree honoring include/exclude globs and spools the
//! archive to a temp file the router streams out. Import unpacks into a
//! staging directory first, validates every entry, then renames the
//! staged entries into place; any failure rolls the staging directory
//! back, so a batch lands all-or-nothing.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use glob::Pattern;
use serde::Serialize;
use tar::{Archive, Builder, EntryType};
use tracing::info;
use walkdir::WalkDir;

use super::errors::{WorkspaceError, WorkspaceResult};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Result of a tar import
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub entries: usize,
    pub bytes: u64,
}

/// Export `src` as a tar archive spooled to a temp file.
pub async fn export(
    src: PathBuf,
    includes: Vec<String>,
    excludes: Vec<String>,
    gzip: bool,
) -> WorkspaceResult<PathBuf> {
    tokio::task::spawn_blocking(move || export_blocking(&src, &includes, &excludes, gzip))
        .await
        .map_err(|e| WorkspaceError::Archive(format!("task join error: {}", e)))?
}

/// Import a tar archive (gzip auto-detected) under `dest`.
pub async fn import(dest: PathBuf, data: Bytes) -> WorkspaceResult<ImportSummary> {
    tokio::task::spawn_blocking(move || import_blocking(&dest, &data))
        .await
        .map_err(|e| WorkspaceError::Archive(format!("task join error: {}", e)))?
}

fn compile_globs(patterns: &[String]) -> WorkspaceResult<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| WorkspaceError::Archive(format!("invalid glob '{}': {}", p, e)))
        })
        .collect()
}

fn selected(rel: &str, includes: &[Pattern], excludes: &[Pattern]) -> bool {
    if excludes.iter().any(|p| p.matches(rel)) {
        return false;
    }
    includes.is_empty() || includes.iter().any(|p| p.matches(rel))
}

fn export_blocking(
    src: &Path,
    includes: &[String],
    excludes: &[String],
    gzip: bool,
) -> WorkspaceResult<PathBuf> {
    let includes = compile_globs(includes)?;
    let excludes = compile_globs(excludes)?;

    let id = uuid::Uuid::new_v4().simple().to_string();
    let spool = std::env::temp_dir().join(format!(
        "devbench-export-{}.tar{}",
        &id[..8],
        if gzip { ".gz" } else { "" }
    ));

    let file = File::create(&spool)?;
    let result = if gzip {
        let encoder = GzEncoder::new(file, Compression::default());
        let mut tar = Builder::new(encoder);
        append_entries(&mut tar, src, &includes, &excludes)
            .and_then(|n| {
                let encoder = tar
                    .into_inner()
                    .map_err(|e| WorkspaceError::Archive(e.to_string()))?;
                encoder.finish()?;
                Ok(n)
            })
    } else {
        let mut tar = Builder::new(file);
        append_entries(&mut tar, src, &includes, &excludes).and_then(|n| {
            tar.finish().map_err(|e| WorkspaceError::Archive(e.to_string()))?;
            Ok(n)
        })
    };

    match result {
        Ok(entries) => {
            info!("exported {} entries from {:?}", entries, src);
            Ok(spool)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&spool);
            Err(e)
        }
    }
}

fn append_entries<W: std::io::Write>(
    tar: &mut Builder<W>,
    src: &Path,
    includes: &[Pattern],
    excludes: &[Pattern],
) -> WorkspaceResult<usize> {
    tar.follow_symlinks(false);

    let mut entries = 0;
    for item in WalkDir::new(src).min_depth(1).follow_links(false) {
        let item = item.map_err(|e| WorkspaceError::Archive(e.to_string()))?;
        let rel = item
            .path()
            .strip_prefix(src)
            .map_err(|e| WorkspaceError::Archive(e.to_string()))?;
        let rel_str = rel.to_string_lossy();

        if !selected(&rel_str, includes, excludes) {
            continue;
        }

        if item.file_type().is_dir() {
            tar.append_dir(rel, item.path())
                .map_err(|e| WorkspaceError::Archive(e.to_string()))?;
        } else {
            // Regular files and symlinks; symlink entries keep their target
            tar.append_path_with_name(item.path(), rel)
                .map_err(|e| WorkspaceError::Archive(e.to_string()))?;
        }
        entries += 1;
    }
    Ok(entries)
}

fn import_blocking(dest: &Path, data: &[u8]) -> WorkspaceResult<ImportSummary> {
    std::fs::create_dir_all(dest)?;

    let id = uuid::Uuid::new_v4().simple().to_string();
    let staging = dest.join(format!(".devbench-import-{}", &id[..8]));
    std::fs::create_dir(&staging)?;

    // Staging is removed on every exit path; after a successful rename
    // pass it is already empty.
    let staging_cleanup = staging.clone();
    scopeguard::defer! {
        let _ = std::fs::remove_dir_all(&staging_cleanup);
    }

    let summary = unpack_into(&staging, data)?;

    // Atomically move staged top-level entries into place
    for item in std::fs::read_dir(&staging)? {
        let item = item?;
        let target = dest.join(item.file_name());
        if target.exists() {
            let meta = std::fs::symlink_metadata(&target)?;
            if meta.is_dir() {
                std::fs::remove_dir_all(&target)?;
            } else {
                std::fs::remove_file(&target)?;
            }
        }
        std::fs::rename(item.path(), &target)?;
    }

    info!("imported {} entries ({} bytes) into {:?}", summary.entries, summary.bytes, dest);
    Ok(summary)
}

fn unpack_into(staging: &Path, data: &[u8]) -> WorkspaceResult<ImportSummary> {
    let reader: Box<dyn Read> = if data.starts_with(&GZIP_MAGIC) {
        Box::new(GzDecoder::new(data))
    } else {
        Box::new(data)
    };

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);

    let mut entries = 0usize;
    let mut bytes = 0u64;

    for entry in archive.entries().map_err(|e| WorkspaceError::Archive(e.to_string()))? {
        let mut entry = entry.map_err(|e| WorkspaceError::Archive(e.to_string()))?;

        let path = entry
            .path()
            .map_err(|e| WorkspaceError::Archive(e.to_string()))?
            .into_owned();
        validate_entry_path(&path)?;

        let header_type = entry.header().entry_type();
        if matches!(header_type, EntryType::Symlink | EntryType::Link) {
            let target = entry
                .link_name()
                .map_err(|e| WorkspaceError::Archive(e.to_string()))?
                .ok_or_else(|| WorkspaceError::Archive("link entry without target".into()))?;
            validate_link_target(&path, &target)?;
        }

        bytes += entry.size();
        let unpacked = entry
            .unpack_in(staging)
            .map_err(|e| WorkspaceError::Archive(e.to_string()))?;
        if !unpacked {
            return Err(WorkspaceError::PathViolation(format!(
                "archive entry '{}' escapes the destination",
                path.display()
            )));
        }
        entries += 1;
    }

    Ok(ImportSummary { entries, bytes })
}

fn validate_entry_path(path: &Path) -> WorkspaceResult<()> {
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(WorkspaceError::PathViolation(format!(
                    "archive entry '{}' escapes the destination",
                    path.display()
                )))
            }
        }
    }
    Ok(())
}

/// Relative link targets must stay under the import root; absolute
/// targets are rejected outright.
fn validate_link_target(entry_path: &Path, target: &Path) -> WorkspaceResult<()> {
    if target.is_absolute() {
        return Err(WorkspaceError::PathViolation(format!(
            "symlink '{}' has an absolute target",
            entry_path.display()
        )));
    }

    let mut depth: i64 = entry_path.components().count() as i64 - 1;
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(WorkspaceError::PathViolation(format!(
                        "symlink '{}' targets outside the destination",
                        entry_path.display()
                    )));
                }
            }
            Component::CurDir => {}
            _ => {
                return Err(WorkspaceError::PathViolation(format!(
                    "symlink '{}' has an invalid target",
                    entry_path.display()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn export_to_bytes(src: &Path, includes: &[&str], excludes: &[&str]) -> Vec<u8> {
        let spool = export(
            src.to_path_buf(),
            includes.iter().map(|s| s.to_string()).collect(),
            excludes.iter().map(|s| s.to_string()).collect(),
            false,
        )
        .await
        .unwrap();
        let data = std::fs::read(&spool).unwrap();
        std::fs::remove_file(&spool).unwrap();
        data
    }

    fn entry_names(data: &[u8]) -> Vec<String> {
        let mut archive = Archive::new(data);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let src = TempDir::new().unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("top.txt"), b"top").unwrap();
        std::fs::write(src.path().join("sub/inner.txt"), b"inner").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::os::unix::fs::symlink("top.txt", src.path().join("link")).unwrap();
            std::fs::set_permissions(
                src.path().join("sub/inner.txt"),
                std::fs::Permissions::from_mode(0o755),
            )
            .unwrap();
        }

        let data = export_to_bytes(src.path(), &[], &[]).await;

        let dest = TempDir::new().unwrap();
        let summary = import(dest.path().to_path_buf(), Bytes::from(data))
            .await
            .unwrap();
        assert!(summary.entries >= 3);

        assert_eq!(std::fs::read(dest.path().join("top.txt")).unwrap(), b"top");
        assert_eq!(std::fs::read(dest.path().join("sub/inner.txt")).unwrap(), b"inner");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let link = std::fs::read_link(dest.path().join("link")).unwrap();
            assert_eq!(link, PathBuf::from("top.txt"));
            let mode = std::fs::metadata(dest.path().join("sub/inner.txt"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn test_export_honors_globs() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("keep.txt"), b"k").unwrap();
        std::fs::write(src.path().join("skip.log"), b"s").unwrap();
        std::fs::write(src.path().join("also.txt"), b"a").unwrap();

        let data = export_to_bytes(src.path(), &["*.txt"], &["also*"]).await;
        let mut names = entry_names(&data);
        names.sort();
        assert_eq!(names, vec!["keep.txt"]);
    }

    #[tokio::test]
    async fn test_gzip_autodetected_on_import() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("f"), b"data").unwrap();

        let spool = export(src.path().to_path_buf(), vec![], vec![], true)
            .await
            .unwrap();
        let data = std::fs::read(&spool).unwrap();
        std::fs::remove_file(&spool).unwrap();
        assert!(data.starts_with(&GZIP_MAGIC));

        let dest = TempDir::new().unwrap();
        import(dest.path().to_path_buf(), Bytes::from(data))
            .await
            .unwrap();
        assert_eq!(std::fs::read(dest.path().join("f")).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_absolute_symlink_rejected_and_rolled_back() {
        let mut builder = Builder::new(Vec::new());

        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "ok.txt", &b"fine"[..])
            .unwrap();

        let mut link_header = tar::Header::new_gnu();
        link_header.set_entry_type(EntryType::Symlink);
        link_header.set_size(0);
        builder
            .append_link(&mut link_header, "evil", "/etc/passwd")
            .unwrap();

        let data = builder.into_inner().unwrap();

        let dest = TempDir::new().unwrap();
        let err = import(dest.path().to_path_buf(), Bytes::from(data))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::PathViolation(_)));

        // The valid first entry was not left behind
        assert!(!dest.path().join("ok.txt").exists());
        assert!(std::fs::read_dir(dest.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_escaping_link_target_rejected() {
        let mut builder = Builder::new(Vec::new());
        let mut link_header = tar::Header::new_gnu();
        link_header.set_entry_type(EntryType::Symlink);
        link_header.set_size(0);
        builder
            .append_link(&mut link_header, "up", "../../outside")
            .unwrap();
        let data = builder.into_inner().unwrap();

        let dest = TempDir::new().unwrap();
        let err = import(dest.path().to_path_buf(), Bytes::from(data))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::PathViolation(_)));
    }

    #[tokio::test]
    async fn test_import_replaces_existing_entries() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("f"), b"new").unwrap();
        let data = export_to_bytes(src.path(), &[], &[]).await;

        let dest = TempDir::new().unwrap();
        std::fs::write(dest.path().join("f"), b"old").unwrap();
        import(dest.path().to_path_buf(), Bytes::from(data))
            .await
            .unwrap();
        assert_eq!(std::fs::read(dest.path().join("f")).unwrap(), b"new");
    }

    #[test]
    fn test_glob_selection() {
        let inc = compile_globs(&["*.txt".into()]).unwrap();
        let exc = compile_globs(&["secret*".into()]).unwrap();
        assert!(selected("a.txt", &inc, &exc));
        assert!(!selected("a.log", &inc, &exc));
        assert!(!selected("secret.txt", &inc, &exc));
        assert!(selected("anything", &[], &[]));
    }
}
