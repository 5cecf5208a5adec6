//! Change detection from cached metadata and a fresh stat

use cvault_core::{FileMetadataEntry, FileStat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No metadata row exists for this path
    New,
    /// Size or mtime moved; the content must be rehashed to know more
    PossiblyChanged,
    /// Size and mtime both match the last successful backup
    Unchanged,
}

impl Verdict {
    pub fn needs_hash(self) -> bool {
        !matches!(self, Verdict::Unchanged)
    }
}

/// Classify a file. Only `Unchanged` lets the backup skip all work; a
/// touched-but-identical file still costs a hash but never an upload.
pub fn detect(prior: Option<&FileMetadataEntry>, stat: &FileStat) -> Verdict {
    match prior {
        None => Verdict::New,
        Some(entry) if entry.size != stat.size || !stat.same_mtime(&entry.modified_date) => {
            Verdict::PossiblyChanged
        }
        Some(_) => Verdict::Unchanged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn stat() -> FileStat {
        FileStat {
            size: 5,
            modified: NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_micro_opt(3, 4, 5, 678_901)
                .unwrap(),
        }
    }

    fn entry_for(stat: &FileStat) -> FileMetadataEntry {
        FileMetadataEntry {
            hash: "0".repeat(64),
            modified_date: stat.modified,
            size: stat.size,
        }
    }

    #[test]
    fn no_entry_is_new() {
        assert_eq!(detect(None, &stat()), Verdict::New);
        assert!(Verdict::New.needs_hash());
    }

    #[test]
    fn matching_entry_is_unchanged() {
        let s = stat();
        assert_eq!(detect(Some(&entry_for(&s)), &s), Verdict::Unchanged);
        assert!(!Verdict::Unchanged.needs_hash());
    }

    #[test]
    fn size_change_is_possibly_changed() {
        let s = stat();
        let mut e = entry_for(&s);
        e.size += 1;
        assert_eq!(detect(Some(&e), &s), Verdict::PossiblyChanged);
    }

    #[test]
    fn mtime_change_is_possibly_changed() {
        let s = stat();
        let mut e = entry_for(&s);
        e.modified_date += Duration::microseconds(1);
        assert_eq!(detect(Some(&e), &s), Verdict::PossiblyChanged);
    }

    #[test]
    fn sub_microsecond_difference_is_ignored() {
        let s = stat();
        let mut e = entry_for(&s);
        e.modified_date += Duration::nanoseconds(300);
        assert_eq!(detect(Some(&e), &s), Verdict::Unchanged);
    }
}
