//! Local tree walk for backup

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Files found under a root, plus directories that could not be read.
#[derive(Debug, Default)]
pub struct Walk {
    pub files: Vec<PathBuf>,
    pub errors: Vec<(PathBuf, io::Error)>,
}

/// Compile exclude globs, dropping (and logging) invalid patterns.
pub fn compile_excludes(patterns: &[String]) -> Vec<glob::Pattern> {
    patterns
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(pattern = %p, "ignoring invalid exclude pattern: {e}");
                None
            }
        })
        .collect()
}

/// Recursively collect regular files under `root`, sorted.
///
/// Symlinks are skipped. Exclude patterns match a file or directory name;
/// an excluded directory is not descended into. An unreadable directory is
/// recorded in `errors` and the walk continues with its siblings.
pub fn collect_files(root: &Path, excludes: &[glob::Pattern]) -> Walk {
    let mut walk = Walk::default();
    collect_inner(root, excludes, &mut walk);
    walk.files.sort(); // deterministic order
    walk
}

fn collect_inner(dir: &Path, excludes: &[glob::Pattern], walk: &mut Walk) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            walk.errors.push((dir.to_path_buf(), e));
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                walk.errors.push((dir.to_path_buf(), e));
                continue;
            }
        };
        let path = entry.path();

        let name = entry.file_name();
        let name = name.to_string_lossy();
        if excludes.iter().any(|p| p.matches(&name)) {
            debug!(path = %path.display(), "excluded");
            continue;
        }

        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                walk.errors.push((path, e));
                continue;
            }
        };
        if file_type.is_dir() {
            collect_inner(&path, excludes, walk);
        } else if file_type.is_file() {
            walk.files.push(path);
        } else if file_type.is_symlink() {
            warn!(path = %path.display(), "symlink not followed, left out of the backup");
        } else {
            debug!(path = %path.display(), "skipping non-regular file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, b"x").unwrap();
    }

    #[test]
    fn collects_nested_files_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), "b.txt");
        touch(tmp.path(), "a/z.txt");
        touch(tmp.path(), "a/b/c.txt");

        let walk = collect_files(tmp.path(), &[]);
        let rel: Vec<_> = walk
            .files
            .iter()
            .map(|p| p.strip_prefix(tmp.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            rel,
            vec![
                PathBuf::from("a/b/c.txt"),
                PathBuf::from("a/z.txt"),
                PathBuf::from("b.txt")
            ]
        );
        assert!(walk.errors.is_empty());
    }

    #[test]
    fn excludes_match_files_and_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), "keep.txt");
        touch(tmp.path(), "scratch.tmp");
        touch(tmp.path(), "cache/inner.txt");

        let excludes = compile_excludes(&["*.tmp".into(), "cache".into(), "[".into()]);
        assert_eq!(excludes.len(), 2, "invalid pattern is dropped");

        let walk = collect_files(tmp.path(), &excludes);
        assert_eq!(walk.files, vec![tmp.path().join("keep.txt")]);
    }

    #[test]
    fn missing_root_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let walk = collect_files(&tmp.path().join("absent"), &[]);
        assert!(walk.files.is_empty());
        assert_eq!(walk.errors.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), "real.txt");
        std::os::unix::fs::symlink(tmp.path().join("real.txt"), tmp.path().join("link.txt"))
            .unwrap();

        let walk = collect_files(tmp.path(), &[]);
        assert_eq!(walk.files, vec![tmp.path().join("real.txt")]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_are_skipped_without_error() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), "dir/inner.txt");
        std::os::unix::fs::symlink(tmp.path().join("dir"), tmp.path().join("loop")).unwrap();

        let walk = collect_files(tmp.path(), &[]);
        assert_eq!(walk.files, vec![tmp.path().join("dir/inner.txt")]);
        assert!(walk.errors.is_empty());
    }
}
