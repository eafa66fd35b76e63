use anyhow::{Context, Ok, Result, bail};
use cleat_error::ErrorParts;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use vbare::OwnedVersionedData;

use crate::atomic::{self, WriteGuardOutcome};
use crate::{Store, errors};

/// Version embedded in state file envelopes.
pub const STATE_VERSION: u16 = 1;

/// Durable record for one actor. User state lives in the per-actor KV
/// database, not here, so this record only changes on lifecycle transitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedActor {
	pub actor_id: String,
	pub name: String,
	pub key: Vec<String>,
	pub create_ts: i64,
	pub start_ts: Option<i64>,
	pub connectable_ts: Option<i64>,
	pub sleep_ts: Option<i64>,
	pub destroy_ts: Option<i64>,
	/// Legacy inline KV. Read once on first load, transferred into the
	/// database, and emptied on the next state write.
	pub kv_storage: Vec<(ByteBuf, ByteBuf)>,
}

impl PersistedActor {
	pub fn new(actor_id: String, name: String, key: Vec<String>, create_ts: i64) -> Self {
		PersistedActor {
			actor_id,
			name,
			key,
			create_ts,
			start_ts: None,
			connectable_ts: None,
			sleep_ts: None,
			destroy_ts: None,
			kv_storage: Vec::new(),
		}
	}
}

pub enum PersistedActorVersioned {
	V1(PersistedActor),
}

impl OwnedVersionedData for PersistedActorVersioned {
	type Latest = PersistedActor;

	fn wrap_latest(latest: PersistedActor) -> Self {
		PersistedActorVersioned::V1(latest)
	}

	fn unwrap_latest(self) -> Result<Self::Latest> {
		#[allow(irrefutable_let_patterns)]
		if let PersistedActorVersioned::V1(data) = self {
			Ok(data)
		} else {
			bail!("version not latest");
		}
	}

	fn deserialize_version(payload: &[u8], version: u16) -> Result<Self> {
		match version {
			1 => Ok(PersistedActorVersioned::V1(serde_bare::from_slice(payload)?)),
			_ => bail!("invalid version: {version}"),
		}
	}

	fn serialize_version(self, _version: u16) -> Result<Vec<u8>> {
		match self {
			PersistedActorVersioned::V1(data) => serde_bare::to_vec(&data).map_err(Into::into),
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
	/// Atomically persists an actor record. `guard` is consulted after the
	/// temp file is written but before the rename; an abort fails with
	/// `store.stale_generation` and leaves the previous file untouched.
	#[tracing::instrument(skip_all, fields(actor_id = %state.actor_id))]
	pub async fn write_state(
		&self,
		state: &PersistedActor,
		guard: impl FnOnce() -> WriteGuardOutcome,
	) -> Result<()> {
		let actor_id = state.actor_id.clone();
		let bytes = PersistedActorVersioned::wrap_latest(state.clone())
			.serialize_with_embedded_version(STATE_VERSION)
			.context("failed to serialize actor state")?;

		let committed = atomic::write_atomic(&self.state_path(&actor_id), bytes, guard).await?;
		if !committed {
			return Err(errors::Store::StaleGeneration { actor_id }.build());
		}

		Ok(())
	}

	/// Loads an actor record. Returns `None` when the actor has never been
	/// persisted; any other I/O error is surfaced to the caller.
	pub async fn load_state(&self, actor_id: &str) -> Result<Option<PersistedActor>> {
		let Some(bytes) = atomic::read_optional(&self.state_path(actor_id)).await? else {
			return Ok(None);
		};

		let state = PersistedActorVersioned::deserialize_with_embedded_version(&bytes)
			.with_context(|| format!("corrupt state file for actor: {actor_id}"))?;

		Ok(Some(state))
	}
}
