use anyhow::{Context, Ok, Result, bail};
use serde::{Deserialize, Serialize};
use vbare::OwnedVersionedData;

use crate::Store;
use crate::atomic::{self, WriteGuardOutcome};

/// Version embedded in alarm file envelopes.
pub const ALARM_VERSION: u16 = 1;

/// One pending alarm. There is at most one per actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmRecord {
	pub actor_id: String,
	pub timestamp_ms: i64,
}

pub enum AlarmRecordVersioned {
	V1(AlarmRecord),
}

impl OwnedVersionedData for AlarmRecordVersioned {
	type Latest = AlarmRecord;

	fn wrap_latest(latest: AlarmRecord) -> Self {
		AlarmRecordVersioned::V1(latest)
	}

	fn unwrap_latest(self) -> Result<Self::Latest> {
		#[allow(irrefutable_let_patterns)]
		if let AlarmRecordVersioned::V1(data) = self {
			Ok(data)
		} else {
			bail!("version not latest");
		}
	}

	fn deserialize_version(payload: &[u8], version: u16) -> Result<Self> {
		match version {
			1 => Ok(AlarmRecordVersioned::V1(serde_bare::from_slice(payload)?)),
			_ => bail!("invalid version: {version}"),
		}
	}

	fn serialize_version(self, _version: u16) -> Result<Vec<u8>> {
		match self {
			AlarmRecordVersioned::V1(data) => serde_bare::to_vec(&data).map_err(Into::into),
		}
	}

	fn deserialize_converters() -> Vec<impl Fn(Self) -> Result<Self>> {
		Vec::<fn(Self) -> Result<Self>>::new()
	}

	fn serialize_converters() -> Vec<impl Fn(Self) -> Result<Self>> {
		Vec::<fn(Self) -> Result<Self>>::new()
	}
}

impl Store {
	/// Persists an alarm via the usual temp-and-rename discipline. Returns
	/// `false` without writing when the guard aborts (actor stopping or
	/// superseded generation).
	#[tracing::instrument(skip_all, fields(actor_id = %record.actor_id, ts = record.timestamp_ms))]
	pub async fn write_alarm(
		&self,
		record: &AlarmRecord,
		guard: impl FnOnce() -> WriteGuardOutcome,
	) -> Result<bool> {
		let bytes = AlarmRecordVersioned::wrap_latest(record.clone())
			.serialize_with_embedded_version(ALARM_VERSION)
			.context("failed to serialize alarm record")?;

		atomic::write_atomic(&self.alarm_path(&record.actor_id), bytes, guard).await
	}

	pub async fn load_alarm(&self, actor_id: &str) -> Result<Option<AlarmRecord>> {
		let Some(bytes) = atomic::read_optional(&self.alarm_path(actor_id)).await? else {
			return Ok(None);
		};

		let record = AlarmRecordVersioned::deserialize_with_embedded_version(&bytes)
			.with_context(|| format!("corrupt alarm file for actor: {actor_id}"))?;

		Ok(Some(record))
	}

	pub async fn delete_alarm(&self, actor_id: &str) -> Result<()> {
		match tokio::fs::remove_file(self.alarm_path(actor_id)).await {
			std::result::Result::Ok(()) => Ok(()),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(err).context("failed to remove alarm file"),
		}
	}

	/// Reads every pending alarm, used for crash recovery at startup. Corrupt
	/// or transient entries are skipped with a warning rather than aborting
	/// the replay.
	pub async fn list_alarms(&self) -> Result<Vec<AlarmRecord>> {
		let mut entries = tokio::fs::read_dir(self.alarms_dir())
			.await
			.context("failed to read alarms dir")?;

		let mut alarms = Vec::new();
		while let Some(entry) = entries.next_entry().await? {
			let name = entry.file_name();
			let Some(name) = name.to_str() else {
				continue;
			};
			if name.contains(".tmp.") {
				continue;
			}

			match self.load_alarm(name).await {
				std::result::Result::Ok(Some(record)) => alarms.push(record),
				std::result::Result::Ok(None) => {}
				Err(err) => {
					tracing::warn!(actor_id = name, ?err, "skipping unreadable alarm file");
				}
			}
		}

		Ok(alarms)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn alarm_round_trip_and_listing() {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::open(dir.path()).await.unwrap();

		let record = AlarmRecord {
			actor_id: "0011223344556677".into(),
			timestamp_ms: 1_700_000_123_456,
		};
		assert!(
			store
				.write_alarm(&record, || WriteGuardOutcome::Commit)
				.await
				.unwrap()
		);

		assert_eq!(
			store.load_alarm("0011223344556677").await.unwrap(),
			Some(record.clone())
		);
		assert_eq!(store.list_alarms().await.unwrap(), vec![record]);

		store.delete_alarm("0011223344556677").await.unwrap();
		assert!(store.load_alarm("0011223344556677").await.unwrap().is_none());
		// Deleting again is a no-op.
		store.delete_alarm("0011223344556677").await.unwrap();
	}

	#[tokio::test]
	async fn skipped_write_leaves_no_file() {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::open(dir.path()).await.unwrap();

		let record = AlarmRecord {
			actor_id: "8899aabbccddeeff".into(),
			timestamp_ms: 42,
		};
		assert!(
			!store
				.write_alarm(&record, || WriteGuardOutcome::Abort)
				.await
				.unwrap()
		);
		assert!(store.load_alarm("8899aabbccddeeff").await.unwrap().is_none());
	}
}
