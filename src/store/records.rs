//! Startup record loading with migration from the point table.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;

use super::Store;
use crate::model::PlayerRecord;
use crate::registration::ServerRegistry;

/// Resolves the record for one address.
///
/// A stored record wins. Otherwise the peak is computed from the point table
/// (or the empty record when there is none) and persisted once; if another
/// writer got there first, the stored value is used instead.
pub async fn resolve_record<S: Store>(store: &S, address: &str) -> Result<PlayerRecord> {
    if let Some(record) = store
        .get_record(address)
        .await
        .with_context(|| format!("reading record for {address}"))?
    {
        return Ok(record);
    }

    let legacy = store
        .get_legacy_record(address)
        .await
        .with_context(|| format!("computing legacy record for {address}"))?
        .unwrap_or_else(PlayerRecord::empty);

    let inserted = store
        .insert_record_if_absent(address, legacy)
        .await
        .with_context(|| format!("storing migrated record for {address}"))?;

    if inserted {
        tracing::info!(
            server = %address,
            player_count = ?legacy.player_count,
            timestamp = ?legacy.timestamp,
            "migrated record from ping history",
        );
        return Ok(legacy);
    }

    let stored = store
        .get_record(address)
        .await
        .with_context(|| format!("re-reading record for {address}"))?;

    Ok(stored.unwrap_or(legacy))
}

/// Loads every registered server's record concurrently.
///
/// Returns once all servers resolved; the first failure aborts the load.
pub async fn load_records<S: Store + 'static>(
    store: Arc<S>,
    registry: Arc<ServerRegistry>,
) -> Result<()> {
    let total = registry.len();
    let completed = Arc::new(AtomicUsize::new(0));
    let mut tasks = JoinSet::new();

    for (server_id, address) in registry.addresses().into_iter().enumerate() {
        let store = Arc::clone(&store);
        let registry = Arc::clone(&registry);
        let completed = Arc::clone(&completed);

        tasks.spawn(async move {
            let record = resolve_record(store.as_ref(), &address).await?;

            if let Some(registration) = registry.get(server_id) {
                registration.lock().set_record(record);
            }

            let done = completed.fetch_add(1, Ordering::AcqRel) + 1;
            if done == total {
                tracing::info!(servers = total, "records ready");
            }

            Ok::<_, anyhow::Error>(())
        });
    }

    while let Some(joined) = tasks.join_next().await {
        joined.context("record load task panicked")??;
    }

    Ok(())
}
