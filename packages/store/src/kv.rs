use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use cleat_error::ErrorParts;
use rusqlite::{Connection, params};

use crate::errors;

/// Per-actor embedded SQLite store, schema `kv(key BLOB PRIMARY KEY,
/// value BLOB)`. All access funnels through `spawn_blocking`; the connection
/// is owned exclusively by the actor.
#[derive(Clone)]
pub struct KvDb {
	actor_id: String,
	conn: Arc<Mutex<Option<Connection>>>,
}

impl KvDb {
	#[tracing::instrument(skip_all, fields(actor_id = %actor_id))]
	pub(crate) async fn open(path: PathBuf, actor_id: String) -> Result<Self> {
		let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
			let conn = Connection::open(&path)
				.with_context(|| format!("failed to open kv database: {}", path.display()))?;
			conn.pragma_update(None, "journal_mode", "WAL")?;
			conn.pragma_update(None, "synchronous", "NORMAL")?;
			conn.execute_batch(
				"CREATE TABLE IF NOT EXISTS kv (key BLOB PRIMARY KEY, value BLOB NOT NULL)",
			)?;
			Ok(conn)
		})
		.await
		.context("kv open task panicked")??;

		Ok(KvDb {
			actor_id,
			conn: Arc::new(Mutex::new(Some(conn))),
		})
	}

	pub fn actor_id(&self) -> &str {
		&self.actor_id
	}

	async fn with_conn<T, F>(&self, f: F) -> Result<T>
	where
		T: Send + 'static,
		F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
	{
		let conn = self.conn.clone();
		tokio::task::spawn_blocking(move || {
			let mut guard = conn.lock().expect("kv mutex poisoned");
			let conn = guard
				.as_mut()
				.ok_or_else(|| errors::Store::DatabaseClosed.build())?;
			f(conn)
		})
		.await
		.context("kv task panicked")?
	}

	pub async fn batch_put(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
		if entries.is_empty() {
			return Ok(());
		}

		self.with_conn(move |conn| {
			let tx = conn.transaction()?;
			{
				let mut stmt = tx.prepare_cached(
					"INSERT INTO kv (key, value) VALUES (?1, ?2) \
					 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
				)?;
				for (key, value) in &entries {
					stmt.execute(params![key, value])?;
				}
			}
			tx.commit()?;
			Ok(())
		})
		.await
	}

	/// Returns one slot per requested key, `None` where the key is absent.
	pub async fn batch_get(&self, keys: Vec<Vec<u8>>) -> Result<Vec<Option<Vec<u8>>>> {
		if keys.is_empty() {
			return Ok(Vec::new());
		}

		self.with_conn(move |conn| {
			let mut stmt = conn.prepare_cached("SELECT value FROM kv WHERE key = ?1")?;
			let mut out = Vec::with_capacity(keys.len());
			for key in &keys {
				let value = stmt
					.query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
					.map(Some)
					.or_else(|err| match err {
						rusqlite::Error::QueryReturnedNoRows => Ok(None),
						err => Err(err),
					})?;
				out.push(value);
			}
			Ok(out)
		})
		.await
	}

	pub async fn batch_delete(&self, keys: Vec<Vec<u8>>) -> Result<()> {
		if keys.is_empty() {
			return Ok(());
		}

		self.with_conn(move |conn| {
			let tx = conn.transaction()?;
			{
				let mut stmt = tx.prepare_cached("DELETE FROM kv WHERE key = ?1")?;
				for key in &keys {
					stmt.execute(params![key])?;
				}
			}
			tx.commit()?;
			Ok(())
		})
		.await
	}

	/// Lists entries whose key starts with `prefix`, in key order. The scan
	/// range is `key >= prefix AND key < upper_bound(prefix)` where the upper
	/// bound increments the last non-0xFF byte and truncates the tail.
	pub async fn list_prefix(
		&self,
		prefix: Vec<u8>,
		limit: Option<usize>,
	) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		self.with_conn(move |conn| {
			let upper = cleat_util::key_bounds::prefix_upper_bound(&prefix);
			let limit = limit.map(|l| l as i64).unwrap_or(-1);

			let mut out = Vec::new();
			match upper {
				Some(upper) => {
					let mut stmt = conn.prepare_cached(
						"SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 \
						 ORDER BY key LIMIT ?3",
					)?;
					let rows = stmt.query_map(params![prefix, upper, limit], |row| {
						std::result::Result::Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
					})?;
					for row in rows {
						out.push(row?);
					}
				}
				None => {
					let mut stmt = conn.prepare_cached(
						"SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key LIMIT ?2",
					)?;
					let rows = stmt.query_map(params![prefix, limit], |row| {
						std::result::Result::Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
					})?;
					for row in rows {
						out.push(row?);
					}
				}
			}

			Ok(out)
		})
		.await
	}

	pub async fn is_empty(&self) -> Result<bool> {
		self.with_conn(|conn| {
			let count: i64 = conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))?;
			Ok(count == 0)
		})
		.await
	}

	/// Closes the underlying connection. Later calls fail with
	/// `store.database_closed`. Closing twice is a no-op.
	pub async fn close(&self) -> Result<()> {
		let conn = self.conn.clone();
		tokio::task::spawn_blocking(move || {
			let taken = conn.lock().expect("kv mutex poisoned").take();
			if let Some(conn) = taken {
				if let Err((_conn, err)) = conn.close() {
					tracing::warn!(?err, "failed to close kv database cleanly");
				}
			}
		})
		.await
		.context("kv close task panicked")?;

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::Store;

	async fn open_test_kv() -> (tempfile::TempDir, KvDb) {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::open(dir.path()).await.unwrap();
		let kv = store.open_kv("0123456789abcdef").await.unwrap();
		(dir, kv)
	}

	#[tokio::test]
	async fn batch_ops() {
		let (_dir, kv) = open_test_kv().await;

		kv.batch_put(vec![
			(b"a".to_vec(), b"1".to_vec()),
			(b"b".to_vec(), b"2".to_vec()),
		])
		.await
		.unwrap();

		// Upsert overwrites.
		kv.batch_put(vec![(b"a".to_vec(), b"3".to_vec())])
			.await
			.unwrap();

		let got = kv
			.batch_get(vec![b"a".to_vec(), b"missing".to_vec(), b"b".to_vec()])
			.await
			.unwrap();
		assert_eq!(
			got,
			vec![Some(b"3".to_vec()), None, Some(b"2".to_vec())]
		);

		kv.batch_delete(vec![b"a".to_vec()]).await.unwrap();
		let got = kv.batch_get(vec![b"a".to_vec()]).await.unwrap();
		assert_eq!(got, vec![None]);
	}

	#[tokio::test]
	async fn prefix_scan_respects_bounds() {
		let (_dir, kv) = open_test_kv().await;

		kv.batch_put(vec![
			(b"user:1".to_vec(), b"a".to_vec()),
			(b"user:2".to_vec(), b"b".to_vec()),
			(b"uses:1".to_vec(), b"x".to_vec()),
			(b"other".to_vec(), b"y".to_vec()),
		])
		.await
		.unwrap();

		let entries = kv.list_prefix(b"user:".to_vec(), None).await.unwrap();
		let keys: Vec<_> = entries.iter().map(|(k, _)| k.clone()).collect();
		assert_eq!(keys, vec![b"user:1".to_vec(), b"user:2".to_vec()]);

		let limited = kv.list_prefix(b"user:".to_vec(), Some(1)).await.unwrap();
		assert_eq!(limited.len(), 1);
	}

	#[tokio::test]
	async fn closed_db_rejects_ops() {
		let (_dir, kv) = open_test_kv().await;
		kv.close().await.unwrap();

		let err = kv.batch_put(vec![(b"k".to_vec(), b"v".to_vec())]).await;
		let extracted = cleat_error::CleatError::extract(&err.unwrap_err());
		assert_eq!(extracted.code_path(), "store.database_closed");

		// Double close is fine.
		kv.close().await.unwrap();
	}
}
