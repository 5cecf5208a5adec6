//! Bounded per-file worker pool

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use cvault_core::VaultResult;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::join_error;

/// Run `task` for every `(path_key, item)` with at most `workers` in
/// flight, handing each result to `on_done` as it completes.
///
/// Cancellation stops new tasks from being issued; tasks already running
/// finish and are still reported. Returns true if the run was cancelled
/// before every item was issued.
pub(crate) async fn for_each_file<T, O, F, Fut>(
    items: Vec<(String, T)>,
    workers: usize,
    cancel: &CancellationToken,
    task: F,
    mut on_done: impl FnMut(String, VaultResult<O>),
) -> bool
where
    T: Send + 'static,
    O: Send + 'static,
    F: Fn(String, T) -> Fut,
    Fut: Future<Output = VaultResult<O>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();
    let mut keys: HashMap<Id, String> = HashMap::new();
    let mut cancelled = false;

    for (key, item) in items {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            cancelled = true;
            break;
        };

        let work = task(key.clone(), item);
        let handle = tasks.spawn(async move {
            let _permit = permit;
            work.await
        });
        keys.insert(handle.id(), key);

        while let Some(joined) = tasks.try_join_next_with_id() {
            settle(joined, &mut keys, &mut on_done);
        }
    }

    while let Some(joined) = tasks.join_next_with_id().await {
        settle(joined, &mut keys, &mut on_done);
    }
    cancelled
}

fn settle<O>(
    joined: Result<(Id, VaultResult<O>), JoinError>,
    keys: &mut HashMap<Id, String>,
    on_done: &mut impl FnMut(String, VaultResult<O>),
) {
    match joined {
        Ok((id, result)) => {
            let key = keys.remove(&id).unwrap_or_default();
            on_done(key, result);
        }
        Err(e) => {
            let key = keys.remove(&e.id()).unwrap_or_default();
            on_done(key, Err(join_error(e)));
        }
    }
}
