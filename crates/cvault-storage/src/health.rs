//! Storage health check

use cvault_core::VaultResult;
use opendal::Operator;

use crate::map_err;

/// Verify the storage endpoint is reachable by listing the root
pub async fn check_health(op: &Operator) -> VaultResult<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| map_err("storage health check failed", e))
}
