//! Runs synchronous store calls on the blocking thread pool.

use std::sync::Arc;

use keel_store::{StoreError, TableStore};

use crate::errors::PipelineError;

/// Run `f` against `store` on the blocking pool.
///
/// The outer error reports a panicked task; the inner result is the store's.
pub(crate) async fn run_blocking<T, F>(
    store: &Arc<dyn TableStore>,
    operation: &'static str,
    f: F,
) -> Result<Result<T, StoreError>, PipelineError>
where
    T: Send + 'static,
    F: FnOnce(&dyn TableStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| {
            PipelineError::Infrastructure(anyhow::anyhow!("{operation} task panicked: {e}"))
        })
}
