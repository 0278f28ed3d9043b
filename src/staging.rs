//! Staging directories for process-backed containers.
//!
//! Process-based image tools cannot bind-mount arbitrary host trees over the
//! image root without hiding the image's own files (e.g. its `/opt` Python
//! install). All injected content is therefore materialized into one stage
//! directory that is bound at a single well-known container path; a
//! bootstrap step inside the container relocates it.
//!
//! ```text
//! <staging_root>/<container-id>-<suffix>/
//! ├── stage/            bound at /run/procrun/stage
//! │   ├── run/det/...   archive destinations, mirrored from /
//! │   └── etc/ssh/...
//! └── exit.json         written by the shim on exit
//! ```

use crate::constants::{EXIT_RECORD_FILE, MAX_STAGED_BYTES, STAGE_SUBDIR};
use crate::error::{Error, Result};
use crate::spec::{ItemKind, RunArchive};
use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// A per-container staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingDir {
    root: PathBuf,
}

impl StagingDir {
    /// Creates a fresh staging directory for `id` under `staging_root`.
    pub fn create(staging_root: &Path, id: &str) -> Result<Self> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let root = staging_root.join(format!("{id}-{}", &suffix[..8]));
        let staging_err = |e: std::io::Error| Error::StagingFailed {
            id: id.to_string(),
            path: root.clone(),
            reason: e.to_string(),
        };
        fs::create_dir_all(root.join(STAGE_SUBDIR)).map_err(staging_err)?;
        fs::set_permissions(&root, fs::Permissions::from_mode(0o700)).map_err(staging_err)?;
        debug!(container = %id, path = %root.display(), "Created staging directory");
        Ok(Self { root })
    }

    /// Wraps an existing directory (e.g. loaded from persisted state).
    pub fn open(root: PathBuf) -> Self {
        Self { root }
    }

    /// Returns the staging directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Returns the directory bound into the container.
    pub fn stage(&self) -> PathBuf {
        self.root.join(STAGE_SUBDIR)
    }

    /// Returns the path of the shim's exit record.
    pub fn exit_record(&self) -> PathBuf {
        self.root.join(EXIT_RECORD_FILE)
    }

    /// Materializes `archives` into the stage directory.
    ///
    /// Destinations are mirrored under the stage (`/run/det/x` lands at
    /// `stage/run/det/x`). Item paths may not escape their destination,
    /// neither through `..` nor through a symlink staged by an earlier item.
    pub fn materialize(&self, id: &str, archives: &[RunArchive]) -> Result<()> {
        let stage = self.stage();
        let mut total = 0u64;

        for archive in archives {
            let dest = safe_join(&stage, &archive.path).ok_or_else(|| Error::StagingFailed {
                id: id.to_string(),
                path: stage.clone(),
                reason: format!("unsafe archive destination '{}'", archive.path),
            })?;

            for item in &archive.items {
                let target = safe_join(&dest, &item.path).ok_or_else(|| Error::StagingFailed {
                    id: id.to_string(),
                    path: dest.clone(),
                    reason: format!("path traversal in archive item '{}'", item.path),
                })?;

                // Replacing a symlink itself is fine, writing through one is not.
                let through_target = item.kind != ItemKind::Symlink;
                if let Some(link) = staged_symlink(&stage, &target, through_target) {
                    return Err(Error::StagingFailed {
                        id: id.to_string(),
                        path: link,
                        reason: format!("archive item '{}' traverses a symlink", item.path),
                    });
                }

                total += item.content.len() as u64;
                if total > MAX_STAGED_BYTES {
                    return Err(Error::StagingFailed {
                        id: id.to_string(),
                        path: stage.clone(),
                        reason: format!("archives exceed {MAX_STAGED_BYTES} bytes"),
                    });
                }

                write_item(&target, item.kind, &item.content, item.mode).map_err(|e| {
                    Error::StagingFailed {
                        id: id.to_string(),
                        path: target.clone(),
                        reason: e.to_string(),
                    }
                })?;
            }
        }

        debug!(container = %id, bytes = total, "Materialized archives");
        Ok(())
    }

    /// Removes the staging directory. Failures are logged, not returned.
    pub fn remove(&self) {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => debug!(path = %self.root.display(), "Removed staging directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.root.display(),
                error = %e,
                "Failed to remove staging directory"
            ),
        }
    }
}

/// Joins a container path onto `base`, rejecting `..` components.
///
/// Leading `/` is treated as relative to `base`.
fn safe_join(base: &Path, path: &str) -> Option<PathBuf> {
    let mut out = base.to_path_buf();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Returns the first existing symlink on the way from `base` to `target`.
///
/// `target` itself is checked only if `include_target` is set.
fn staged_symlink(base: &Path, target: &Path, include_target: bool) -> Option<PathBuf> {
    let relative = target.strip_prefix(base).ok()?;
    let mut current = base.to_path_buf();
    for component in relative.components() {
        current.push(component);
        if current == target && !include_target {
            break;
        }
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return Some(current),
            Ok(_) => {}
            // Nothing further down exists yet.
            Err(_) => break,
        }
    }
    None
}

fn write_item(target: &Path, kind: ItemKind, content: &[u8], mode: u32) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match kind {
        ItemKind::Directory => {
            fs::create_dir_all(target)?;
            let mode = if mode == 0 { 0o755 } else { mode };
            fs::set_permissions(target, fs::Permissions::from_mode(mode))
        }
        ItemKind::File => {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .custom_flags(libc::O_NOFOLLOW)
                .open(target)?;
            file.write_all(content)?;
            let mode = if mode == 0 { 0o644 } else { mode };
            file.set_permissions(fs::Permissions::from_mode(mode))
        }
        ItemKind::Symlink => {
            let link = String::from_utf8_lossy(content).into_owned();
            if fs::symlink_metadata(target).is_ok() {
                fs::remove_file(target)?;
            }
            std::os::unix::fs::symlink(link, target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ArchiveItem;
    use tempfile::TempDir;

    #[test]
    fn test_safe_join() {
        let base = Path::new("/stage");
        assert_eq!(
            safe_join(base, "/run/det/train"),
            Some(PathBuf::from("/stage/run/det/train"))
        );
        assert_eq!(safe_join(base, "./a/b"), Some(PathBuf::from("/stage/a/b")));
        assert_eq!(safe_join(base, "a/../../etc"), None);
    }

    #[test]
    fn test_materialize_mirrors_destinations() {
        let tmp = TempDir::new().unwrap();
        let staging = StagingDir::create(tmp.path(), "c1").unwrap();
        let archives = vec![RunArchive {
            path: "/run/det".into(),
            items: vec![
                ArchiveItem::dir("train", 0o700),
                ArchiveItem::file("train/entrypoint.sh", b"#!/bin/sh\n".to_vec(), 0o755),
                ArchiveItem::symlink("current", "train"),
            ],
        }];

        staging.materialize("c1", &archives).unwrap();

        let script = staging.stage().join("run/det/train/entrypoint.sh");
        assert_eq!(fs::read(&script).unwrap(), b"#!/bin/sh\n");
        let mode = fs::metadata(&script).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
        let link = fs::read_link(staging.stage().join("run/det/current")).unwrap();
        assert_eq!(link, PathBuf::from("train"));
    }

    #[test]
    fn test_materialize_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let staging = StagingDir::create(tmp.path(), "c1").unwrap();
        let archives = vec![RunArchive {
            path: "/run/det".into(),
            items: vec![ArchiveItem::file("../../../escape", b"x".to_vec(), 0)],
        }];

        let err = staging.materialize("c1", &archives).unwrap_err();
        assert!(matches!(err, Error::StagingFailed { .. }));
        assert!(!tmp.path().join("escape").exists());
    }

    #[test]
    fn test_materialize_rejects_write_through_symlink() {
        let tmp = TempDir::new().unwrap();
        let outside = tmp.path().join("outside");
        fs::create_dir(&outside).unwrap();
        let staging = StagingDir::create(tmp.path(), "c1").unwrap();
        let archives = vec![RunArchive {
            path: "/run/det".into(),
            items: vec![
                ArchiveItem::symlink("link", outside.to_str().unwrap()),
                ArchiveItem::file("link/pwned", b"x".to_vec(), 0),
            ],
        }];

        let err = staging.materialize("c1", &archives).unwrap_err();
        assert!(err.to_string().contains("symlink"), "error: {err}");
        assert!(!outside.join("pwned").exists());
    }

    #[test]
    fn test_materialize_rejects_symlinked_destination_and_target() {
        let tmp = TempDir::new().unwrap();
        let outside = tmp.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("config"), b"original").unwrap();
        let staging = StagingDir::create(tmp.path(), "c1").unwrap();

        // A later archive whose destination runs through an earlier link.
        let archives = vec![
            RunArchive {
                path: "/run".into(),
                items: vec![ArchiveItem::symlink("det", outside.to_str().unwrap())],
            },
            RunArchive {
                path: "/run/det".into(),
                items: vec![ArchiveItem::dir("train", 0o700)],
            },
        ];
        assert!(staging.materialize("c1", &archives).is_err());
        assert!(!outside.join("train").exists());

        // A file item landing on a link to an outside file.
        let link = outside.join("config");
        let archives = vec![RunArchive {
            path: "/etc".into(),
            items: vec![
                ArchiveItem::symlink("config", link.to_str().unwrap()),
                ArchiveItem::file("config", b"replaced".to_vec(), 0),
            ],
        }];
        assert!(staging.materialize("c1", &archives).is_err());
        assert_eq!(fs::read(&link).unwrap(), b"original");
    }

    #[test]
    fn test_materialize_replaces_symlink_with_symlink() {
        let tmp = TempDir::new().unwrap();
        let staging = StagingDir::create(tmp.path(), "c1").unwrap();
        let archives = vec![RunArchive {
            path: "/run/det".into(),
            items: vec![
                ArchiveItem::symlink("current", "v1"),
                ArchiveItem::symlink("current", "v2"),
            ],
        }];

        staging.materialize("c1", &archives).unwrap();
        let link = fs::read_link(staging.stage().join("run/det/current")).unwrap();
        assert_eq!(link, PathBuf::from("v2"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let staging = StagingDir::create(tmp.path(), "c1").unwrap();
        assert!(staging.path().exists());
        staging.remove();
        assert!(!staging.path().exists());
        staging.remove();
    }
}
