//! Maintenance of the shared entries tree, `<root>/entries/share`.
//!
//! Every installed layer contributes its `entries/` files (desktop
//! launchers, icons, MIME packages, GSettings schemas) to one shared tree
//! as symlinks, preserving the directory structure, so the host desktop can
//! discover sandboxed applications. Uninstalling removes exactly the links
//! whose names the layer owns.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::task::Task;

/// Subtree of a layer that feeds the shared tree; older layers used
/// `outputs/share` instead.
const ENTRIES_SUBDIR: &str = "entries";
const LEGACY_ENTRIES_SUBDIR: &str = "outputs/share";

/// One minute; the cache compilers are quick or wedged.
const REFRESH_TIMEOUT_SECS: &str = "60";

/// The entries source directory of a checked out layer, honoring the legacy
/// layout.
pub fn layer_entries_dir(layer_root: &Utf8Path) -> Utf8PathBuf {
    let legacy = layer_root.join(LEGACY_ENTRIES_SUBDIR);
    if legacy.is_dir() {
        legacy
    } else {
        layer_root.join(ENTRIES_SUBDIR)
    }
}

/// Link every file below `src` into `dst`, keeping the directory structure.
/// Existing links are replaced so re-linking after an interrupted install
/// converges.
#[context("Linking entries {src} into {dst}")]
pub fn link_entries(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(dst).with_context(|| format!("Creating {dst}"))?;
    for entry in src.read_dir_utf8()? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            link_entries(entry.path(), &target)?;
            continue;
        }
        if target.symlink_metadata().is_ok() {
            std::fs::remove_file(&target)?;
        }
        std::os::unix::fs::symlink(entry.path(), &target)
            .with_context(|| format!("Linking {target}"))?;
    }
    Ok(())
}

/// Remove from `dst` the links whose relative names exist below `src`.
/// Directories are left in place; they are shared across layers.
#[context("Unlinking entries {src} from {dst}")]
pub fn unlink_entries(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    if !src.is_dir() || !dst.is_dir() {
        return Ok(());
    }
    for entry in src.read_dir_utf8()? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            unlink_entries(entry.path(), &target)?;
            continue;
        }
        if target.symlink_metadata().is_ok() {
            std::fs::remove_file(&target)
                .with_context(|| format!("Removing {target}"))?;
        }
    }
    Ok(())
}

/// Rebuild the host-side caches over the shared tree: desktop database,
/// MIME database, and compiled GSettings schemas. Failures here must not
/// fail the surrounding install, so they are logged and swallowed.
pub fn refresh_host_caches(share: &Utf8Path) {
    let applications = share.join("applications");
    if let Err(e) = Task::new("Updating desktop database", "timeout")
        .args([
            REFRESH_TIMEOUT_SECS,
            "update-desktop-database",
            applications.as_str(),
        ])
        .capture_failure()
        .run()
    {
        tracing::warn!("update desktop database of {applications} failed: {e:#}");
    }

    let mime = share.join("mime");
    if mime.join("packages").is_dir() {
        if let Err(e) = Task::new("Updating MIME database", "timeout")
            .args([REFRESH_TIMEOUT_SECS, "update-mime-database", mime.as_str()])
            .capture_failure()
            .run()
        {
            tracing::warn!("update mime type database of {mime} failed: {e:#}");
        }
    }

    let schemas = share.join("glib-2.0/schemas");
    if schemas.is_dir() {
        if let Err(e) = Task::new("Compiling GSettings schemas", "timeout")
            .args([REFRESH_TIMEOUT_SECS, "glib-compile-schemas", schemas.as_str()])
            .capture_failure()
            .run()
        {
            tracing::warn!("update schemas of {schemas} failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8(p: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(p.to_path_buf()).unwrap()
    }

    fn touch(path: &Utf8Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_link_and_unlink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let src = root.join("layer/entries");
        let share = root.join("entries/share");
        touch(&src.join("applications/calc.desktop"));
        touch(&src.join("icons/hicolor/48x48/apps/calc.png"));

        link_entries(&src, &share).unwrap();
        let link = share.join("applications/calc.desktop");
        assert!(link.symlink_metadata().is_ok());
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            src.join("applications/calc.desktop").as_std_path()
        );
        assert!(share
            .join("icons/hicolor/48x48/apps/calc.png")
            .symlink_metadata()
            .is_ok());

        unlink_entries(&src, &share).unwrap();
        assert!(link.symlink_metadata().is_err());
        // Unrelated structure remains.
        assert!(share.join("applications").is_dir());
    }

    #[test]
    fn test_unlink_leaves_other_layers_alone() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let a = root.join("a/entries");
        let b = root.join("b/entries");
        let share = root.join("share");
        touch(&a.join("applications/a.desktop"));
        touch(&b.join("applications/b.desktop"));
        link_entries(&a, &share).unwrap();
        link_entries(&b, &share).unwrap();
        unlink_entries(&a, &share).unwrap();
        assert!(share.join("applications/a.desktop").symlink_metadata().is_err());
        assert!(share.join("applications/b.desktop").symlink_metadata().is_ok());
    }

    #[test]
    fn test_legacy_entries_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        assert_eq!(layer_entries_dir(&root), root.join("entries"));
        std::fs::create_dir_all(root.join("outputs/share")).unwrap();
        assert_eq!(layer_entries_dir(&root), root.join("outputs/share"));
    }
}
