//! Tenant-scoped filesystem layout.
//!
//! Every per-tenant path is derived from a validated [`TenantId`], so two
//! tenants can never resolve to the same session store or artifact.

use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

use crate::types::{validate_task_id, IdError, TenantId};

#[derive(Debug, thiserror::Error)]
pub enum PathGuardError {
    #[error("path {0} escapes the allowed directory")]
    Outside(PathBuf),

    #[error("path {path} cannot be resolved: {source}")]
    Unresolvable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Isolated cookie/session store for one tenant: `<root>/tenant-<id>`.
pub fn session_dir(root: &Path, tenant: &TenantId) -> PathBuf {
    root.join(format!("tenant-{tenant}"))
}

/// Screenshot directory owned by one tenant: `<dir>/<tenant>`.
pub fn tenant_artifact_dir(dir: &Path, tenant: &TenantId) -> PathBuf {
    dir.join(tenant.as_str())
}

/// A fresh, collision-free screenshot path for a challenge.
///
/// Layout: `<dir>/<tenant>/<task>-<millis>-<suffix>.png`.
pub fn challenge_artifact_path(
    dir: &Path,
    tenant: &TenantId,
    task_id: &str,
) -> Result<PathBuf, IdError> {
    validate_task_id(task_id)?;
    let suffix = Uuid::new_v4().simple().to_string();
    Ok(tenant_artifact_dir(dir, tenant).join(format!(
        "{task_id}-{}-{}.png",
        Utc::now().timestamp_millis(),
        &suffix[..8]
    )))
}

/// Resolve `candidate` and confirm it lies inside `base`.
///
/// Both paths are canonicalized, so `..` segments and symlinks that point
/// outside `base` are rejected. The candidate must exist.
pub fn ensure_within(base: &Path, candidate: &Path) -> Result<PathBuf, PathGuardError> {
    let base = base
        .canonicalize()
        .map_err(|source| PathGuardError::Unresolvable {
            path: base.to_path_buf(),
            source,
        })?;
    let resolved = candidate
        .canonicalize()
        .map_err(|source| PathGuardError::Unresolvable {
            path: candidate.to_path_buf(),
            source,
        })?;
    if resolved.starts_with(&base) && resolved != base {
        Ok(resolved)
    } else {
        Err(PathGuardError::Outside(candidate.to_path_buf()))
    }
}

/// Canonical form of a path that may not exist yet: the file itself, or
/// its canonical parent joined with the file name. `None` when neither
/// resolves.
pub fn resolve_lenient(path: &Path) -> Option<PathBuf> {
    if let Ok(resolved) = path.canonicalize() {
        return Some(resolved);
    }
    let name = path.file_name()?;
    let parent = path.parent()?.canonicalize().ok()?;
    Some(parent.join(name))
}

/// Create `dir` (and parents), restricting it to the owner on unix.
pub fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(raw: &str) -> TenantId {
        TenantId::parse(raw).unwrap()
    }

    #[test]
    fn session_dirs_never_collide() {
        let root = Path::new("/tmp/sessions");
        let a = session_dir(root, &tenant("tenant-a"));
        let b = session_dir(root, &tenant("tenant-b"));
        assert_ne!(a, b);
        assert_eq!(a, PathBuf::from("/tmp/sessions/tenant-tenant-a"));
    }

    #[test]
    fn artifact_paths_are_unique_and_scoped() {
        let dir = Path::new("/tmp/challenges");
        let t = tenant("tenant-a");
        let p1 = challenge_artifact_path(dir, &t, "task-1").unwrap();
        let p2 = challenge_artifact_path(dir, &t, "task-1").unwrap();
        assert_ne!(p1, p2);
        assert!(p1.starts_with("/tmp/challenges/tenant-a"));
        assert!(challenge_artifact_path(dir, &t, "../x").is_err());
    }

    #[test]
    fn ensure_within_accepts_nested_file() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("tenant-a");
        std::fs::create_dir_all(&nested).unwrap();
        let file = nested.join("shot.png");
        std::fs::write(&file, b"png").unwrap();
        assert!(ensure_within(tmp.path(), &file).is_ok());
    }

    #[test]
    fn ensure_within_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("artifacts");
        std::fs::create_dir_all(&base).unwrap();
        let outside = tmp.path().join("secret.txt");
        std::fs::write(&outside, b"secret").unwrap();
        let sneaky = base.join("..").join("secret.txt");
        assert!(matches!(
            ensure_within(&base, &sneaky),
            Err(PathGuardError::Outside(_))
        ));
    }

    #[test]
    fn ensure_within_rejects_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.png");
        assert!(matches!(
            ensure_within(tmp.path(), &missing),
            Err(PathGuardError::Unresolvable { .. })
        ));
    }

    #[test]
    fn resolve_lenient_handles_files_not_yet_written() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        std::fs::create_dir_all(base.join("tenant-a")).unwrap();
        std::fs::create_dir_all(base.join("tenant-b")).unwrap();

        let pending = tmp.path().join("tenant-a").join("..").join("tenant-b").join("shot.png");
        assert_eq!(
            resolve_lenient(&pending),
            Some(base.join("tenant-b").join("shot.png"))
        );
        assert_eq!(resolve_lenient(&tmp.path().join("missing").join("x.png")), None);
    }

    #[cfg(unix)]
    #[test]
    fn private_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("tenant-x");
        ensure_private_dir(&dir).unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
