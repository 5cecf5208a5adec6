use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Metadata row for one backed-up file.
///
/// Lives in the `filemetadata` table under (partition = backup-set name,
/// row key = path key). Present iff the content has been stored at least
/// once under `hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadataEntry {
    /// SHA-256 of the plaintext, lowercase hex; also the blob address
    #[serde(rename = "Hash")]
    pub hash: String,
    /// Local mtime recorded at the last successful backup
    #[serde(rename = "ModifiedDate", with = "modified_date")]
    pub modified_date: NaiveDateTime,
    /// File size in bytes
    #[serde(rename = "Size")]
    pub size: u64,
}

/// A password-wrapped data encryption key.
///
/// All three fields are base64 text. `ciphertext` carries the AEAD tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKeyRecord {
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// The subset of local `stat` output used for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modified: NaiveDateTime,
}

impl FileStat {
    pub fn from_metadata(meta: &std::fs::Metadata) -> std::io::Result<Self> {
        Ok(Self {
            size: meta.len(),
            modified: naive_mtime(meta.modified()?),
        })
    }

    /// True when the stored timestamp matches this stat's mtime.
    ///
    /// Wall-clock values are compared without timezone, at microsecond
    /// precision (the finest resolution every metadata backend keeps).
    pub fn same_mtime(&self, other: &NaiveDateTime) -> bool {
        self.modified.and_utc().timestamp_micros() == other.and_utc().timestamp_micros()
    }
}

/// Convert a filesystem timestamp into the naive UTC wall clock we persist.
pub fn naive_mtime(t: SystemTime) -> NaiveDateTime {
    DateTime::<Utc>::from(t).naive_utc()
}

/// `ModifiedDate` is written as RFC 3339 UTC. On read the offset, if any,
/// is discarded and the local wall clock kept; naive timestamps are
/// accepted as-is.
mod modified_date {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.and_utc().to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(dt.naive_local());
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map_err(|e| serde::de::Error::custom(format!("invalid ModifiedDate '{raw}': {e}")))
    }
}
