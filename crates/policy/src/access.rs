//! Filesystem access validation against configured allow-roots and a fixed
//! deny list.
//!
//! Every path is normalized before it is compared: `~` is expanded, relative
//! paths are anchored at the current directory, and each existing component
//! is canonicalized so symlinks resolve to their targets. Components past the
//! deepest existing ancestor are applied lexically until a `..` climbs back
//! onto an existing directory, where resolution resumes. Containment is checked
//! component-wise (`/etc2` is not under `/etc`).

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// System locations that are never accessible, whatever the allow-roots say.
pub const DEFAULT_DENY_ROOTS: &[&str] = &["/etc", "/boot", "/root", "/var/lib", "/usr"];

/// Credential stores under the invoking user's home directory.
const HOME_DENY_DIRS: &[&str] = &["~/.ssh", "~/.gnupg", "~/.aws"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => f.write_str("Read"),
            AccessMode::Write => f.write_str("Write"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    DenyRoot(PathBuf),
    OutsideRoots,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::DenyRoot(root) => write!(f, "inside protected location {}", root.display()),
            DenialReason::OutsideRoots => f.write_str("outside allowed roots"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("{mode} access denied: {} ({reason})", .path.display())]
    Denied {
        path: PathBuf,
        mode: AccessMode,
        reason: DenialReason,
    },
}

impl AccessError {
    pub fn is_denied(&self) -> bool {
        matches!(self, AccessError::Denied { .. })
    }
}

/// Resolved allow-roots plus the deny list that overrides them.
#[derive(Debug, Clone)]
pub struct AccessRoots {
    read_roots: Vec<PathBuf>,
    write_roots: Vec<PathBuf>,
    deny_roots: Vec<PathBuf>,
}

impl AccessRoots {
    pub fn new<R, W, S1, S2>(read_roots: R, write_roots: W) -> Self
    where
        R: IntoIterator<Item = S1>,
        W: IntoIterator<Item = S2>,
        S1: AsRef<str>,
        S2: AsRef<str>,
    {
        let deny_roots = DEFAULT_DENY_ROOTS
            .iter()
            .chain(HOME_DENY_DIRS.iter())
            .copied()
            .filter_map(resolve_root)
            .collect();

        Self {
            read_roots: read_roots.into_iter().filter_map(|r| resolve_root(r.as_ref())).collect(),
            write_roots: write_roots.into_iter().filter_map(|w| resolve_root(w.as_ref())).collect(),
            deny_roots,
        }
    }

    /// Adds deny roots on top of the built-in list. The built-in entries
    /// cannot be removed.
    pub fn with_extra_deny_roots<I, S>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.deny_roots
            .extend(roots.into_iter().filter_map(|r| resolve_root(r.as_ref())));
        self
    }

    pub fn read_roots(&self) -> &[PathBuf] {
        &self.read_roots
    }

    pub fn write_roots(&self) -> &[PathBuf] {
        &self.write_roots
    }

    pub fn deny_roots(&self) -> &[PathBuf] {
        &self.deny_roots
    }
}

fn resolve_root(root: &str) -> Option<PathBuf> {
    if root.trim().is_empty() {
        return None;
    }
    if root.starts_with('~') && shellexpand::tilde(root).starts_with('~') {
        // No home directory to expand against.
        return None;
    }
    match normalize_path(root) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!("Ignoring access root {}: {}", root, e);
            None
        }
    }
}

/// Expands, anchors and symlink-resolves `path` as far as it exists.
pub fn normalize_path(path: &str) -> Result<PathBuf, AccessError> {
    let invalid = |reason: &str| AccessError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if path.trim().is_empty() {
        return Err(invalid("empty path"));
    }
    if path.contains('\0') {
        return Err(invalid("path contains NUL byte"));
    }

    let expanded = PathBuf::from(shellexpand::tilde(path).as_ref());
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map_err(|e| invalid(&format!("cannot determine current directory: {e}")))?
            .join(expanded)
    };

    let mut resolved = PathBuf::new();
    let mut on_disk = true;

    for component in absolute.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
                // Back on an existing prefix: later components must resolve
                // symlinks again.
                if !on_disk {
                    on_disk = fs::symlink_metadata(&resolved).is_ok();
                }
            }
            Component::Normal(name) => {
                resolved.push(name);
                if !on_disk {
                    continue;
                }
                match fs::canonicalize(&resolved) {
                    Ok(canonical) => resolved = canonical,
                    Err(_) => {
                        if fs::symlink_metadata(&resolved)
                            .map(|m| m.file_type().is_symlink())
                            .unwrap_or(false)
                        {
                            return Err(invalid("dangling symlink"));
                        }
                        on_disk = false;
                    }
                }
            }
        }
    }

    Ok(resolved)
}

/// Decides whether a path may be read or written.
#[derive(Debug, Clone)]
pub struct AccessValidator {
    roots: AccessRoots,
}

impl AccessValidator {
    pub fn new(roots: AccessRoots) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &AccessRoots {
        &self.roots
    }

    pub fn can_read(&self, path: &str) -> bool {
        self.validate_read(path).is_ok()
    }

    pub fn can_write(&self, path: &str) -> bool {
        self.validate_write(path).is_ok()
    }

    pub fn validate_read(&self, path: &str) -> Result<PathBuf, AccessError> {
        self.check(path, AccessMode::Read)
    }

    pub fn validate_write(&self, path: &str) -> Result<PathBuf, AccessError> {
        self.check(path, AccessMode::Write)
    }

    fn check(&self, path: &str, mode: AccessMode) -> Result<PathBuf, AccessError> {
        let normalized = normalize_path(path)?;

        if let Some(deny_root) = self.denying_root(&normalized) {
            warn!("Denied {} access to: {}", mode, normalized.display());
            return Err(AccessError::Denied {
                path: normalized,
                mode,
                reason: DenialReason::DenyRoot(deny_root.to_path_buf()),
            });
        }

        let allow_roots = match mode {
            AccessMode::Read => &self.roots.read_roots,
            AccessMode::Write => &self.roots.write_roots,
        };

        if allow_roots.iter().any(|root| normalized.starts_with(root)) {
            return Ok(normalized);
        }

        warn!("Path not in {} roots: {}", mode, normalized.display());
        Err(AccessError::Denied {
            path: normalized,
            mode,
            reason: DenialReason::OutsideRoots,
        })
    }

    fn denying_root(&self, path: &Path) -> Option<&Path> {
        self.roots
            .deny_roots
            .iter()
            .find(|root| path.starts_with(root))
            .map(PathBuf::as_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn str_of(path: &Path) -> &str {
        path.to_str().unwrap()
    }

    fn setup() -> (TempDir, AccessValidator) {
        let temp = TempDir::new().unwrap();
        let base = temp.path().canonicalize().unwrap();
        fs::create_dir_all(base.join("photos/inbox")).unwrap();
        fs::create_dir_all(base.join("photos/organized")).unwrap();
        fs::create_dir_all(base.join("private")).unwrap();

        let roots = AccessRoots::new(
            [str_of(&base.join("photos"))],
            [str_of(&base.join("photos/organized"))],
        )
        .with_extra_deny_roots([str_of(&base.join("photos/inbox/secret"))]);

        (temp, AccessValidator::new(roots))
    }

    #[test]
    fn test_read_inside_root() {
        let (temp, validator) = setup();
        let path = temp.path().join("photos/inbox");
        assert!(validator.can_read(str_of(&path)));
    }

    #[test]
    fn test_write_does_not_imply_read_and_vice_versa() {
        let (temp, validator) = setup();
        let inbox = temp.path().join("photos/inbox");
        assert!(validator.can_read(str_of(&inbox)));
        assert!(!validator.can_write(str_of(&inbox)));

        let organized = temp.path().join("photos/organized");
        assert!(validator.can_write(str_of(&organized)));
    }

    #[test]
    fn test_outside_roots_denied() {
        let (temp, validator) = setup();
        let path = temp.path().join("private");
        assert!(!validator.can_read(str_of(&path)));
        assert!(!validator.can_write(str_of(&path)));
        let err = validator.validate_read(str_of(&path)).unwrap_err();
        assert!(matches!(
            err,
            AccessError::Denied {
                reason: DenialReason::OutsideRoots,
                ..
            }
        ));
    }

    #[test]
    fn test_deny_root_wins_over_allow_root() {
        let (temp, validator) = setup();
        let path = temp.path().join("photos/inbox/secret/key.pem");
        let err = validator.validate_read(str_of(&path)).unwrap_err();
        assert!(matches!(
            err,
            AccessError::Denied {
                reason: DenialReason::DenyRoot(_),
                ..
            }
        ));
    }

    #[test]
    fn test_builtin_deny_roots_cannot_be_allowed() {
        let roots = AccessRoots::new(["/"], ["/"]);
        let validator = AccessValidator::new(roots);
        assert!(!validator.can_read("/etc/passwd"));
        assert!(!validator.can_write("/boot/vmlinuz"));
    }

    #[test]
    fn test_component_wise_containment() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().canonicalize().unwrap();
        fs::create_dir_all(base.join("data")).unwrap();
        fs::create_dir_all(base.join("data2")).unwrap();
        let validator = AccessValidator::new(AccessRoots::new(
            [str_of(&base.join("data"))],
            Vec::<&str>::new(),
        ));

        assert!(validator.can_read(str_of(&base.join("data/file.txt"))));
        assert!(!validator.can_read(str_of(&base.join("data2/file.txt"))));
    }

    #[test]
    fn test_parent_traversal_is_resolved() {
        let (temp, validator) = setup();
        let sneaky = format!("{}/photos/organized/../../private", str_of(temp.path()));
        assert!(!validator.can_read(&sneaky));
        let inside = format!("{}/photos/organized/../inbox", str_of(temp.path()));
        assert!(validator.can_read(&inside));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_denied() {
        let (temp, validator) = setup();
        let link = temp.path().join("photos/organized/escape");
        std::os::unix::fs::symlink(temp.path().join("private"), &link).unwrap();
        assert!(!validator.can_write(str_of(&link.join("new.txt"))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_after_missing_component_and_parent_denied() {
        let (temp, validator) = setup();
        let organized = temp.path().join("photos/organized");
        std::os::unix::fs::symlink(temp.path().join("private"), organized.join("escape")).unwrap();

        let sneaky = format!("{}/missing/../escape/out", str_of(&organized));
        let err = validator.validate_write(&sneaky).unwrap_err();
        match err {
            AccessError::Denied { path, reason, .. } => {
                assert_eq!(reason, DenialReason::OutsideRoots);
                assert!(path.ends_with("private/out"), "{}", path.display());
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let fine = format!("{}/missing/../2024_01/new.jpg", str_of(&organized));
        assert!(validator.can_write(&fine));
    }

    #[test]
    fn test_nonexistent_path_under_root() {
        let (temp, validator) = setup();
        let path = temp.path().join("photos/organized/2024_01/new.jpg");
        let resolved = validator.validate_write(str_of(&path)).unwrap();
        assert!(resolved.ends_with("2024_01/new.jpg"));
    }

    #[test]
    fn test_invalid_path_is_distinct_error() {
        let (_temp, validator) = setup();
        let err = validator.validate_read("").unwrap_err();
        assert!(matches!(err, AccessError::InvalidPath { .. }));
        assert!(!err.is_denied());

        let err = validator.validate_read("/tmp/bad\0path").unwrap_err();
        assert!(matches!(err, AccessError::InvalidPath { .. }));
    }
}
