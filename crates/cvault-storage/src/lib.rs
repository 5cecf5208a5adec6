//! cvault-storage: OpenDAL-backed blob store and metadata tables
//!
//! Two operators back a vault: one container of encrypted content blobs
//! keyed by plaintext SHA-256, and one container of JSON entity documents
//! laid out as `{table}/{partition}/{row_key}`.

pub mod blob;
pub mod health;
pub mod operator;
pub mod table;

pub use blob::{BlobStore, ByteStream, OpendalBlobStore};
pub use health::check_health;
pub use operator::{build_operator, build_stores, check_endpoint_tls, Credentials, StoreOperators};
pub use table::{Entity, EntityPage, EntityStore, OpendalEntityStore, Table, PAGE_SIZE};

use cvault_core::VaultError;

/// Map an opendal error onto the vault taxonomy.
///
/// `NotFound` is handled by callers that know what was missing.
pub(crate) fn map_err(context: &str, e: opendal::Error) -> VaultError {
    if e.is_temporary() {
        VaultError::StoreUnavailable(format!("{context}: {e}"))
    } else {
        VaultError::Storage(format!("{context}: {e}"))
    }
}

pub(crate) fn is_not_found(e: &opendal::Error) -> bool {
    e.kind() == opendal::ErrorKind::NotFound
}
