//! Typed absolute/real paths, longest-common-ancestor, and nearest-ancestor
//! manifest search (§3, §4.1).
//!
//! Grounded on the teacher's `resolve_watch_path`/`collapse_watch_paths`
//! (`engine/runner/watch.rs`): splitting a path into a concrete, on-disk root
//! and normalizing/collapsing a set of watch roots to their shared ancestors.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};

/// A string known to be absolute and lexically normalized (`.`/`..`
/// collapsed), but not necessarily free of symlinks. Equality is byte-equal
/// on the normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AbsolutePath(Utf8PathBuf);

impl AbsolutePath {
    /// Resolves `path` against `base` (itself assumed absolute) and
    /// lexically normalizes the result. Does not touch the filesystem.
    pub fn resolve(base: &Utf8Path, path: &str) -> Self {
        let joined = if Utf8Path::new(path).is_absolute() {
            Utf8PathBuf::from(path)
        } else {
            base.join(path)
        };
        AbsolutePath(normalize(&joined))
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.0
    }

    pub fn into_path_buf(self) -> Utf8PathBuf {
        self.0
    }
}

impl std::fmt::Display for AbsolutePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An [`AbsolutePath`] with all symlinks resolved. Equality is byte-equal
/// on the canonical form, which is what makes two [`InputPath`](crate::project::InputPath)s
/// collide (§3 "Two InputPaths collide iff their `real` fields are equal").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RealPath(Utf8PathBuf);

impl RealPath {
    /// `realpath`s `path`. Propagates `io::Error` unchanged so callers can
    /// distinguish `ErrorKind::NotFound` (per §4.1, step 3) from other
    /// failures.
    pub fn resolve(path: &AbsolutePath) -> io::Result<Self> {
        let real = std::fs::canonicalize(path.as_path())?;
        let real = Utf8PathBuf::from_path_buf(real)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 path"))?;
        Ok(RealPath(real))
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.0
    }
}

impl std::fmt::Display for RealPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lexically collapses `.`/`..` components without touching the filesystem.
fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    use camino::Utf8Component;

    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Utf8Component::Normal(_))) {
                    out.pop();
                } else {
                    out.push("..");
                }
            }
            Utf8Component::CurDir => {}
            other => out.push(other.as_str()),
        }
    }
    out
}

/// The longest common ancestor directory shared by every path in `paths`.
/// Returns `None` if `paths` is empty or the paths share no common root
/// (e.g. disjoint drive letters on Windows) — the §4.1 step 7 `NoCommonRoot`
/// case.
pub fn longest_common_ancestor<'a>(
    paths: impl IntoIterator<Item = &'a Utf8Path>,
) -> Option<Utf8PathBuf> {
    let mut iter = paths.into_iter();
    let first = iter.next()?;
    let mut common: Vec<&str> = first.components().map(|c| c.as_str()).collect();

    for path in iter {
        let components: Vec<&str> = path.components().map(|c| c.as_str()).collect();
        let shared = common
            .iter()
            .zip(components.iter())
            .take_while(|(a, b)| a == b)
            .count();
        common.truncate(shared);
        if common.is_empty() {
            return None;
        }
    }

    if common.is_empty() {
        return None;
    }

    let mut result = Utf8PathBuf::new();
    for component in &common {
        result.push(component);
    }
    Some(result)
}

/// Walks ancestors of `start` (inclusive, starting at `start`'s directory)
/// looking for a file named `manifest_name`. Returns the manifest's path if
/// found (§4.1 step 5, "nearest-ancestor lookup").
pub fn nearest_ancestor_file(start: &Utf8Path, manifest_name: &str) -> Option<Utf8PathBuf> {
    let mut dir = if start.is_dir() {
        Some(start.to_path_buf())
    } else {
        start.parent().map(|p| p.to_path_buf())
    };

    while let Some(current) = dir {
        let candidate = current.join(manifest_name);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = current.parent().map(|p| p.to_path_buf());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_dot_and_dotdot() {
        let base = Utf8Path::new("/a/b");
        let resolved = AbsolutePath::resolve(base, "../c/./d");
        assert_eq!(resolved.as_path(), Utf8Path::new("/a/c/d"));
    }

    #[test]
    fn resolve_absolute_input_ignores_base() {
        let base = Utf8Path::new("/a/b");
        let resolved = AbsolutePath::resolve(base, "/x/y");
        assert_eq!(resolved.as_path(), Utf8Path::new("/x/y"));
    }

    #[test]
    fn lca_of_single_path_is_itself() {
        let p = Utf8PathBuf::from("/a/b/c");
        let lca = longest_common_ancestor([p.as_path()]);
        assert_eq!(lca, Some(p));
    }

    #[test]
    fn lca_finds_shared_prefix() {
        let a = Utf8PathBuf::from("/a/b/c");
        let b = Utf8PathBuf::from("/a/b/d/e");
        let c = Utf8PathBuf::from("/a/x");
        let lca = longest_common_ancestor([a.as_path(), b.as_path(), c.as_path()]);
        assert_eq!(lca, Some(Utf8PathBuf::from("/a")));
    }

    #[test]
    fn lca_empty_is_none() {
        let paths: Vec<&Utf8Path> = vec![];
        assert_eq!(longest_common_ancestor(paths), None);
    }

    #[test]
    fn lca_disjoint_roots_is_none() {
        let a = Utf8PathBuf::from("/a/b");
        let b = Utf8PathBuf::from("c:/b");
        assert_eq!(longest_common_ancestor([a.as_path(), b.as_path()]), None);
    }

    #[test]
    fn nearest_ancestor_file_finds_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(root.join("elm.json"), "{}").unwrap();
        std::fs::create_dir_all(root.join("src/sub")).unwrap();

        let found = nearest_ancestor_file(&root.join("src/sub"), "elm.json");
        assert_eq!(found, Some(root.join("elm.json")));
    }

    #[test]
    fn nearest_ancestor_file_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();

        assert_eq!(nearest_ancestor_file(&root.join("src"), "elm.json"), None);
    }
}
