use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use anyhow::{Context, Result};
use cleat_config::Config;
use cleat_error::ErrorParts;
use cleat_store::{KvDb, PersistedActor, Store};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::alarm::AlarmScheduler;
use crate::definition::ActorDefinition;
use crate::entry::{Entry, Lifecycle};
use crate::errors;
use crate::instance::{Instance, RESTART_BACKOFF, StopReason};

/// Bound on load/create races before giving up; each round waits out a full
/// stop transition, so hitting it means something is wedged.
const LOAD_OR_CREATE_ROUNDS: usize = 32;

/// Process-wide actor registry: one entry per known actor id, plus the
/// registered definitions.
pub struct Registry {
	config: Config,
	store: Store,
	definitions: HashMap<String, Arc<ActorDefinition>>,
	entries: scc::HashMap<String, Arc<Entry>>,
	alarms: OnceLock<Weak<AlarmScheduler>>,
}

impl Registry {
	pub fn new(config: Config, store: Store, definitions: Vec<ActorDefinition>) -> Arc<Self> {
		let definitions = definitions
			.into_iter()
			.map(|def| (def.name.clone(), Arc::new(def)))
			.collect();

		Arc::new(Registry {
			config,
			store,
			definitions,
			entries: scc::HashMap::new(),
			alarms: OnceLock::new(),
		})
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn store(&self) -> &Store {
		&self.store
	}

	pub fn definition(&self, name: &str) -> Option<Arc<ActorDefinition>> {
		self.definitions.get(name).cloned()
	}

	pub(crate) fn set_alarms(&self, alarms: Weak<AlarmScheduler>) {
		let _ = self.alarms.set(alarms);
	}

	pub(crate) fn alarms(&self) -> Option<Arc<AlarmScheduler>> {
		self.alarms.get().and_then(Weak::upgrade)
	}

	fn entry(&self, actor_id: &str) -> Arc<Entry> {
		if let Some(entry) = self.entries.read(actor_id, |_, entry| entry.clone()) {
			return entry;
		}
		let entry = Entry::new(actor_id.to_string());
		match self.entries.insert(actor_id.to_string(), entry.clone()) {
			Ok(()) => entry,
			// Lost the race; use the winner.
			Err(_) => self
				.entries
				.read(actor_id, |_, entry| entry.clone())
				.unwrap_or(entry),
		}
	}

	pub fn get_entry(&self, actor_id: &str) -> Option<Arc<Entry>> {
		self.entries.read(actor_id, |_, entry| entry.clone())
	}

	/// Stable-ordered snapshot of all entries.
	pub fn snapshot(&self) -> Vec<Arc<Entry>> {
		let mut entries = Vec::new();
		self.entries.scan(|_, entry| entries.push(entry.clone()));
		entries.sort_by(|a, b| a.actor_id.cmp(&b.actor_id));
		entries
	}

	/// Returns the entry for `actor_id`, single-flighting a persistence read
	/// if this id has not been seen yet. The entry's `state` stays absent
	/// when the actor does not exist.
	#[tracing::instrument(skip(self))]
	pub async fn load_actor(&self, actor_id: &str) -> Result<Arc<Entry>> {
		let entry = self.entry(actor_id);

		let _load = entry.load_lock.lock().await;
		{
			let inner = entry.inner.lock();
			if inner.loaded || inner.state.is_some() || inner.lifecycle == Lifecycle::Destroyed {
				return Ok(entry.clone());
			}
		}

		let state = self.store.load_state(actor_id).await?;

		let mut inner = entry.inner.lock();
		inner.loaded = true;
		if inner.state.is_none() && inner.lifecycle == Lifecycle::Nonexistent {
			if let Some(mut state) = state {
				// Runtime KV is database-only; the legacy inline list was
				// migrated at startup.
				state.kv_storage = Vec::new();
				inner.state = Some(state);
			}
		}
		drop(inner);

		Ok(entry.clone())
	}

	/// Creates the actor: persists a fresh record and seeds its KV store.
	/// Fails with `actor.duplicate_key` when the id already has state.
	#[tracing::instrument(skip(self, input))]
	pub async fn create_actor(
		&self,
		actor_id: &str,
		name: &str,
		key: &[String],
		input: Value,
	) -> Result<Arc<Entry>> {
		let definition = self
			.definition(name)
			.with_context(|| format!("no definition registered for actor name: {name}"))?;

		loop {
			let entry = self.load_actor(actor_id).await?;
			if entry.is_stopping() {
				entry.wait_stopped().await;
				continue;
			}

			// The load lock doubles as the create critical section so two
			// concurrent creates cannot both write a fresh record.
			let _create = entry.load_lock.lock().await;
			if entry.is_stopping() {
				continue;
			}

			let generation = {
				let mut inner = entry.inner.lock();
				if inner.state.is_some() {
					return Err(errors::Actor::DuplicateKey {
						existing_actor_id: actor_id.to_string(),
					}
					.build());
				}
				if inner.lifecycle == Lifecycle::Destroyed {
					inner.lifecycle = Lifecycle::Nonexistent;
					inner.generation = Uuid::new_v4();
				}
				inner.generation
			};

			// A failing create hook aborts before anything is persisted.
			if let Some(hook) = definition.hooks.on_create.clone() {
				tokio::time::timeout(self.config.runtime.hook_timeout(), hook(input.clone()))
					.await
					.map_err(|_| errors::Action::TimedOut.build())
					.and_then(|res| res)
					.context("create hook failed")?;
			}

			let state = PersistedActor::new(
				actor_id.to_string(),
				name.to_string(),
				key.to_vec(),
				cleat_util::timestamp::now(),
			);

			{
				let _chain = entry.write_chain.lock().await;
				self.store
					.write_state(&state, entry.write_guard(generation))
					.await?;
				entry.inner.lock().state = Some(state);
			}

			let kv = self.ensure_kv(&entry).await?;
			if let Some(initial_kv) = &definition.initial_kv {
				let seed = initial_kv(&input)?;
				if !seed.is_empty() {
					let seed = seed
						.into_iter()
						.map(|(k, v)| (cleat_store::keys::user_key(&k), v))
						.collect();
					kv.batch_put(seed).await?;
				}
			}

			tracing::info!(actor_id, name, "actor created");
			return Ok(entry.clone());
		}
	}

	/// Load-or-create race loop: retries through concurrent stops and
	/// creations until the actor's state exists.
	pub async fn load_or_create_actor(
		&self,
		actor_id: &str,
		name: &str,
		key: &[String],
		input: Value,
	) -> Result<Arc<Entry>> {
		for _ in 0..LOAD_OR_CREATE_ROUNDS {
			let entry = self.load_actor(actor_id).await?;
			if entry.is_stopping() {
				entry.wait_stopped().await;
				continue;
			}
			if entry.state_exists() {
				return Ok(entry);
			}

			match self.create_actor(actor_id, name, key, input.clone()).await {
				Ok(entry) => return Ok(entry),
				Err(err)
					if cleat_error::CleatError::extract(&err).code_path()
						== "actor.duplicate_key" =>
				{
					// Someone else created it between our load and create.
					continue;
				}
				Err(err) => return Err(err),
			}
		}

		Err(anyhow::anyhow!(
			"load_or_create did not converge for actor: {actor_id}"
		))
	}

	/// Brings the actor to `Awake` with a live instance, single-flighting
	/// concurrent starts.
	#[tracing::instrument(skip(self))]
	pub async fn start_actor(self: &Arc<Self>, actor_id: &str) -> Result<Arc<Instance>> {
		loop {
			let entry = self.load_actor(actor_id).await?;
			if entry.is_stopping() {
				entry.wait_stopped().await;
				continue;
			}

			let _start = entry.start_lock.lock().await;
			if entry.is_stopping() {
				continue;
			}
			if let Some(instance) = entry.instance() {
				return Ok(instance);
			}

			let Some(mut state) = entry.state() else {
				return Err(errors::Actor::NotFound.build());
			};
			let definition = self.definition(&state.name).with_context(|| {
				format!("no definition registered for actor name: {}", state.name)
			})?;

			let generation = {
				let mut inner = entry.inner.lock();
				inner.lifecycle = Lifecycle::Awake;
				inner.generation
			};

			// Clearing sleep_ts is atomic with the start transition; the
			// same write empties any migrated inline KV for good.
			let now = cleat_util::timestamp::now();
			state.start_ts = Some(now);
			state.connectable_ts = Some(now);
			state.sleep_ts = None;
			state.kv_storage = Vec::new();
			{
				let _chain = entry.write_chain.lock().await;
				self.store
					.write_state(&state, entry.write_guard(generation))
					.await?;
				entry.inner.lock().state = Some(state.clone());
			}

			let kv = self.ensure_kv(&entry).await?;
			let instance = match Instance::start(
				self,
				actor_id.to_string(),
				state.name.clone(),
				state.key.clone(),
				definition,
				kv,
				entry.write_chain.clone(),
			)
			.await
			{
				Ok(instance) => instance,
				Err(err) => {
					let mut inner = entry.inner.lock();
					inner.lifecycle = Lifecycle::Nonexistent;
					inner.instance = None;
					return Err(err);
				}
			};

			entry.inner.lock().instance = Some(instance.clone());
			tracing::info!(actor_id, name = %state.name, "actor started");
			return Ok(instance);
		}
	}

	pub async fn sleep_actor(self: &Arc<Self>, actor_id: &str) -> Result<()> {
		self.stop_actor(actor_id, StopReason::Sleep).await
	}

	pub async fn destroy_actor(self: &Arc<Self>, actor_id: &str) -> Result<()> {
		self.stop_actor(actor_id, StopReason::Destroy).await
	}

	#[tracing::instrument(skip(self))]
	async fn stop_actor(self: &Arc<Self>, actor_id: &str, reason: StopReason) -> Result<()> {
		let (entry, stop_tx) = loop {
			let entry = match reason {
				// Sleeping an actor that is not resident is a no-op.
				StopReason::Sleep => match self.get_entry(actor_id) {
					Some(entry) => entry,
					None => return Ok(()),
				},
				// Destroy also applies to cold actors with on-disk state.
				StopReason::Destroy => self.load_actor(actor_id).await?,
			};

			if let Some(mut rx) = entry.stop_rx() {
				if !*rx.borrow() {
					let _ = rx.changed().await;
				}
				match reason {
					// The in-flight stop covers us.
					StopReason::Sleep => return Ok(()),
					// Retry so a destroy behind a sleep still deletes files.
					StopReason::Destroy => continue,
				}
			}

			let mut inner = entry.inner.lock();
			match reason {
				StopReason::Sleep => {
					if inner.instance.is_none() {
						return Ok(());
					}
				}
				StopReason::Destroy => {
					if inner.lifecycle == Lifecycle::Destroyed {
						return Ok(());
					}
					if inner.state.is_none() && inner.instance.is_none() {
						// Nothing exists; nothing to destroy.
						return Err(errors::Actor::NotFound.build());
					}
				}
			}

			let (tx, rx) = watch::channel(false);
			inner.stop_rx = Some(rx);
			inner.lifecycle = match reason {
				StopReason::Sleep => Lifecycle::StartingSleep,
				StopReason::Destroy => Lifecycle::StartingDestroy,
			};
			drop(inner);
			break (entry, tx);
		};

		// Let any in-flight load or start settle before tearing down.
		drop(entry.load_lock.lock().await);
		drop(entry.start_lock.lock().await);

		let generation = entry.generation();
		let instance = entry.instance();
		let now = cleat_util::timestamp::now();

		match reason {
			StopReason::Sleep => {
				// sleep_ts lands on disk so a cold load knows the actor was
				// sleeping, not crashed.
				if let Some(mut state) = entry.state() {
					state.sleep_ts = Some(now);
					state.kv_storage = Vec::new();
					let _chain = entry.write_chain.lock().await;
					match self
						.store
						.write_state(&state, entry.write_guard(generation))
						.await
					{
						Ok(()) => entry.inner.lock().state = Some(state),
						Err(err) => {
							tracing::warn!(actor_id, ?err, "failed to persist sleep timestamp")
						}
					}
				}
			}
			StopReason::Destroy => {
				// Files are about to be unlinked; the timestamp only needs to
				// live in the retained entry.
				if let Some(state) = entry.inner.lock().state.as_mut() {
					state.destroy_ts = Some(now);
				}
			}
		}

		if let Some(instance) = &instance {
			instance.stop(reason).await;
		}

		// Drain the pending write chain before closing the database under it.
		drop(entry.write_chain.lock().await);

		let kv = entry.inner.lock().kv.take();
		if let Some(kv) = kv {
			if let Err(err) = kv.close().await {
				tracing::warn!(actor_id, ?err, "failed to close kv database");
			}
		}

		if reason == StopReason::Destroy {
			if let Some(alarms) = self.alarms() {
				alarms.cancel_timer(actor_id);
			}
			if let Err(err) = self.store.delete_actor_files(actor_id).await {
				tracing::warn!(actor_id, ?err, "failed to delete actor files");
			}
		}

		{
			let mut inner = entry.inner.lock();
			inner.instance = None;
			inner.stop_rx = None;
			inner.state = None;
			match reason {
				StopReason::Sleep => {
					inner.lifecycle = Lifecycle::Nonexistent;
					inner.loaded = false;
				}
				StopReason::Destroy => {
					// The entry stays resident as a tombstone against
					// resurrection races.
					inner.lifecycle = Lifecycle::Destroyed;
				}
			}
		}

		if reason == StopReason::Sleep {
			// Removing the entry lets the same id load cold later.
			self.entries.remove(actor_id);
		}

		let _ = stop_tx.send(true);
		tracing::info!(actor_id, ?reason, "actor stopped");

		Ok(())
	}

	/// Crash handling for a failed `run`: everything is torn down like a
	/// sleep, then the manager restarts the actor after a backoff.
	pub(crate) async fn crash_actor(self: &Arc<Self>, actor_id: String) {
		tracing::error!(actor_id = %actor_id, "actor crashed");
		if let Err(err) = self.sleep_actor(&actor_id).await {
			tracing::warn!(actor_id = %actor_id, ?err, "failed to stop crashed actor");
		}

		let registry = self.clone();
		tokio::spawn(async move {
			tokio::time::sleep(RESTART_BACKOFF).await;
			match registry.start_actor(&actor_id).await {
				Ok(_) => tracing::info!(actor_id = %actor_id, "actor restarted after crash"),
				Err(err) => {
					tracing::error!(actor_id = %actor_id, ?err, "failed to restart crashed actor")
				}
			}
		});
	}

	async fn ensure_kv(&self, entry: &Arc<Entry>) -> Result<KvDb> {
		if let Some(kv) = entry.kv() {
			return Ok(kv);
		}
		let kv = self.store.open_kv(&entry.actor_id).await?;
		let mut inner = entry.inner.lock();
		match &inner.kv {
			Some(existing) => Ok(existing.clone()),
			None => {
				inner.kv = Some(kv.clone());
				Ok(kv)
			}
		}
	}

	/// Puts every awake actor to sleep. Used by runtime shutdown.
	pub async fn close(self: &Arc<Self>) {
		let entries = self.snapshot();
		for entry in entries {
			if entry.instance().is_some() {
				if let Err(err) = self.sleep_actor(&entry.actor_id).await {
					tracing::warn!(actor_id = %entry.actor_id, ?err, "failed to sleep actor during shutdown");
				}
			}
		}
	}
}
