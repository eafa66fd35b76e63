mod alarm_file;
mod atomic;
pub mod errors;
pub mod keys;
mod kv;
mod migrate;
mod state_file;

pub use alarm_file::AlarmRecord;
pub use atomic::WriteGuardOutcome;
pub use kv::KvDb;
pub use state_file::PersistedActor;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// On-disk substrate for the runtime. Three directories under the storage
/// root: `state/` (actor records), `databases/` (per-actor SQLite KV), and
/// `alarms/` (pending alarm files).
#[derive(Debug, Clone)]
pub struct Store {
	state_dir: PathBuf,
	databases_dir: PathBuf,
	alarms_dir: PathBuf,
}

impl Store {
	/// Opens the store, creating directories, clearing stale temp files, and
	/// running the one-time inline-KV migration.
	#[tracing::instrument(skip_all, fields(root = %root.as_ref().display()))]
	pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
		let root = root.as_ref();
		let store = Store {
			state_dir: root.join("state"),
			databases_dir: root.join("databases"),
			alarms_dir: root.join("alarms"),
		};

		for dir in [&store.state_dir, &store.databases_dir, &store.alarms_dir] {
			tokio::fs::create_dir_all(dir)
				.await
				.with_context(|| format!("failed to create storage dir: {}", dir.display()))?;
		}

		atomic::cleanup_temp_files(&store.state_dir).await?;
		atomic::cleanup_temp_files(&store.alarms_dir).await?;

		migrate::run(&store).await?;

		Ok(store)
	}

	pub fn state_path(&self, actor_id: &str) -> PathBuf {
		self.state_dir.join(actor_id)
	}

	pub fn db_path(&self, actor_id: &str) -> PathBuf {
		self.databases_dir.join(format!("{actor_id}.db"))
	}

	pub fn alarm_path(&self, actor_id: &str) -> PathBuf {
		self.alarms_dir.join(actor_id)
	}

	pub(crate) fn state_dir(&self) -> &Path {
		&self.state_dir
	}

	pub(crate) fn alarms_dir(&self) -> &Path {
		&self.alarms_dir
	}

	/// Opens the per-actor KV database, creating it if missing.
	pub async fn open_kv(&self, actor_id: &str) -> Result<KvDb> {
		KvDb::open(self.db_path(actor_id), actor_id.to_string()).await
	}

	/// Unlinks state, database, and alarm files. Missing files are not
	/// errors.
	#[tracing::instrument(skip(self))]
	pub async fn delete_actor_files(&self, actor_id: &str) -> Result<()> {
		let db_path = self.db_path(actor_id);
		let wal_path = db_path.with_extension("db-wal");
		let shm_path = db_path.with_extension("db-shm");

		let (state_res, db_res, wal_res, shm_res, alarm_res) = tokio::join!(
			remove_if_exists(self.state_path(actor_id)),
			remove_if_exists(db_path),
			remove_if_exists(wal_path),
			remove_if_exists(shm_path),
			remove_if_exists(self.alarm_path(actor_id)),
		);
		state_res?;
		db_res?;
		wal_res?;
		shm_res?;
		alarm_res?;

		Ok(())
	}
}

async fn remove_if_exists(path: PathBuf) -> Result<()> {
	match tokio::fs::remove_file(&path).await {
		Ok(()) => Ok(()),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(err) => {
			Err(err).with_context(|| format!("failed to remove file: {}", path.display()))
		}
	}
}
