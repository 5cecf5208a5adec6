//! Path keys: filesystem paths flattened into metadata row identifiers.
//!
//! Every code path that turns a path (or a path prefix) into a row key goes
//! through [`normalize`], so `/` and `\` are always replaced the same way
//! regardless of the host's separator convention.

use std::path::{Component, Path, PathBuf};

/// Reserved character standing in for path separators inside row keys.
pub const SEPARATOR: char = '|';

fn normalize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c == '/' || c == '\\' { SEPARATOR } else { c })
        .collect()
}

/// Row key for a path relative to the backup root.
///
/// `photos/2024/a.jpg` becomes `photos|2024|a.jpg`. `.` components are
/// dropped; a leading root or prefix component is ignored.
pub fn path_key(rel: &Path) -> String {
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(normalize(&s.to_string_lossy())),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect();
    parts.join(&SEPARATOR.to_string())
}

/// Row key prefix for a user-supplied path prefix (e.g. `--prefix photos/`).
pub fn prefix_key(prefix: &str) -> String {
    normalize(prefix.trim_start_matches("./"))
        .trim_start_matches(SEPARATOR)
        .to_string()
}

/// Reverse of [`path_key`]. Returns `None` for keys that would escape the
/// restore target: empty, `.` or `..` segments, and any segment the host
/// does not parse as one plain file name (roots, drive prefixes).
pub fn path_from_key(key: &str) -> Option<PathBuf> {
    if key.is_empty() {
        return None;
    }
    let mut path = PathBuf::new();
    for segment in key.split(SEPARATOR) {
        if segment.is_empty() || segment == "." || segment == ".." || !is_single_name(segment) {
            return None;
        }
        path.push(segment);
    }
    Some(path)
}

fn is_single_name(segment: &str) -> bool {
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == segment
    )
}

/// Exclusive upper bound for a "starts with `prefix`" range scan.
///
/// Increments the code point of the last character (`"abc"` → `"abd"`),
/// stepping over the surrogate gap. A trailing `char::MAX` cannot be
/// incremented, so it is dropped and the previous character is bumped
/// instead. Returns `None` when no finite bound exists, including for the
/// empty prefix (callers then scan the whole partition).
pub fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let next = match last {
            '\u{D7FF}' => Some('\u{E000}'),
            c => char::from_u32(c as u32 + 1),
        };
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}
