pub mod config;
pub mod error;
pub mod path_key;
pub mod types;

pub use error::{VaultError, VaultResult};
pub use path_key::{path_from_key, path_key, prefix_key, prefix_upper_bound};
pub use types::{FileMetadataEntry, FileStat, WrappedKeyRecord};
