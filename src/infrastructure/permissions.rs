//! Owner and mode propagation on the policy volume

use std::path::Path;

use crate::error::{AppError, AppResult};

/// Give `target` the owner and mode of `reference`.
#[cfg(unix)]
pub fn copy_owner_and_mode(reference: &Path, target: &Path) -> AppResult<()> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let reference_meta = std::fs::metadata(reference)
        .map_err(|e| AppError::file(format!("Cannot stat {}", reference.display()), e))?;
    let target_meta = match std::fs::metadata(target) {
        Ok(meta) => meta,
        // Temp files of a concurrent writer may vanish mid-walk.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(AppError::file(format!("Cannot stat {}", target.display()), e)),
    };

    let mut mode = reference_meta.mode() & 0o7777;
    if target_meta.is_file() && reference_meta.is_dir() {
        // Directory search bits would make every file executable.
        mode &= !0o111;
    }
    std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode))
        .map_err(|e| AppError::file(format!("Cannot chmod {}", target.display()), e))?;

    if reference_meta.uid() != target_meta.uid() || reference_meta.gid() != target_meta.gid() {
        std::os::unix::fs::chown(target, Some(reference_meta.uid()), Some(reference_meta.gid()))
            .map_err(|e| AppError::file(format!("Cannot chown {}", target.display()), e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn copy_owner_and_mode(_reference: &Path, _target: &Path) -> AppResult<()> {
    Ok(())
}

/// Apply `reference`'s owner and mode to `root` and everything below it.
pub fn align_tree(reference: &Path, root: &Path) -> AppResult<()> {
    // Children first, the new mode may drop our own access to `root`.
    if root.is_dir() {
        let entries = std::fs::read_dir(root)
            .map_err(|e| AppError::file(format!("Cannot read {}", root.display()), e))?;
        for entry in entries {
            let entry = entry?;
            align_tree(reference, &entry.path())?;
        }
    }
    copy_owner_and_mode(reference, root)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn mode(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn test_align_tree_applies_reference_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let reference = tmp.path().join("reference");
        std::fs::create_dir(&reference).unwrap();
        std::fs::set_permissions(&reference, std::fs::Permissions::from_mode(0o750)).unwrap();

        let root = tmp.path().join("policy");
        std::fs::create_dir_all(root.join("User/Scripts")).unwrap();
        std::fs::write(root.join("User/Scripts/a.ps1"), "x").unwrap();

        align_tree(&reference, &root).unwrap();
        assert_eq!(mode(&root), 0o750);
        assert_eq!(mode(&root.join("User/Scripts")), 0o750);
        assert_eq!(mode(&root.join("User/Scripts/a.ps1")), 0o640);
    }

    #[test]
    fn test_missing_reference() {
        let tmp = tempfile::tempdir().unwrap();
        let err = copy_owner_and_mode(&tmp.path().join("nope"), tmp.path()).unwrap_err();
        assert_eq!(err.error_code(), "FILE_OPERATION_FAILED");
    }
}
