use std::fmt::{self, Display};
use std::path::{Component, Path, PathBuf};

/// Normalized absolute path used as a cache key.
///
/// Existing files are canonicalized so that symlinks and relative spellings
/// collapse to one key. Paths that do not exist (yet) are normalized
/// lexically against the current directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathFingerprint(PathBuf);

impl PathFingerprint {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if let Ok(canonical) = std::fs::canonicalize(path) {
            return Self(canonical);
        }
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            match std::env::current_dir() {
                Ok(cwd) => cwd.join(path),
                Err(_) => path.to_path_buf(),
            }
        };
        Self(normalize_lexically(&absolute))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for PathFingerprint {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Display for PathFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
///
/// `..` never climbs above the root of an absolute path.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
