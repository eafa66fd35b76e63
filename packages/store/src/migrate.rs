use anyhow::{Context, Result};

use crate::{Store, keys};

/// One-time migration of legacy inline KV into the per-actor database.
///
/// For every state file whose `kv_storage` is non-empty and whose database is
/// empty, entries are transferred into the database. The inline list itself
/// is emptied on the actor's next state write, so repeated invocations are
/// no-ops: a non-empty database means the transfer already happened.
#[tracing::instrument(skip_all)]
pub(crate) async fn run(store: &Store) -> Result<()> {
	let mut entries = tokio::fs::read_dir(store.state_dir())
		.await
		.context("failed to read state dir")?;

	while let Some(entry) = entries.next_entry().await? {
		let name = entry.file_name();
		let Some(actor_id) = name.to_str() else {
			continue;
		};
		if actor_id.contains(".tmp.") {
			continue;
		}

		let state = match store.load_state(actor_id).await {
			Ok(Some(state)) => state,
			Ok(None) => continue,
			Err(err) => {
				tracing::warn!(actor_id, ?err, "skipping unreadable state file in migration");
				continue;
			}
		};

		if state.kv_storage.is_empty() {
			continue;
		}

		let kv = store.open_kv(actor_id).await?;
		if !kv.is_empty().await? {
			kv.close().await?;
			continue;
		}

		// Legacy inline entries are user data; they must land under the user
		// namespace or runtime reads will never see them.
		let count = state.kv_storage.len();
		kv.batch_put(
			state
				.kv_storage
				.into_iter()
				.map(|(k, v)| (keys::user_key(&k), v.into_vec()))
				.collect(),
		)
		.await?;
		kv.close().await?;

		tracing::info!(actor_id, count, "migrated legacy inline kv entries");
	}

	Ok(())
}
