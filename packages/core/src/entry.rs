use std::sync::Arc;

use cleat_store::{KvDb, PersistedActor, WriteGuardOutcome};
use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use crate::instance::Instance;

/// Lifecycle of a registry entry.
///
/// `Nonexistent` covers both "never created" and "loaded but not running";
/// the distinction is whether `state` is present. Sleeping actors have no
/// entry at all: the entry is removed so a later load starts cold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
	Nonexistent,
	Awake,
	StartingSleep,
	StartingDestroy,
	Destroyed,
}

pub(crate) struct EntryInner {
	pub state: Option<PersistedActor>,
	pub lifecycle: Lifecycle,
	pub generation: Uuid,
	pub instance: Option<Arc<Instance>>,
	pub kv: Option<KvDb>,
	/// Whether a persistence read has been attempted for this entry.
	pub loaded: bool,
	/// Present while a sleep or destroy is in flight; resolves to `true`
	/// when the transition completes.
	pub stop_rx: Option<watch::Receiver<bool>>,
}

/// One known actor id. Entries are created on first reference and only
/// removed when the actor goes to sleep.
pub struct Entry {
	pub actor_id: String,
	pub(crate) inner: Mutex<EntryInner>,
	/// Single-flights concurrent loads and guards the create critical
	/// section.
	pub(crate) load_lock: tokio::sync::Mutex<()>,
	/// Single-flights concurrent starts.
	pub(crate) start_lock: tokio::sync::Mutex<()>,
	/// Serialization point for state and KV writes. Tokio's mutex queues
	/// waiters fairly, so the chain is strictly FIFO.
	pub(crate) write_chain: Arc<tokio::sync::Mutex<()>>,
}

impl Entry {
	pub(crate) fn new(actor_id: String) -> Arc<Self> {
		Arc::new(Entry {
			actor_id,
			inner: Mutex::new(EntryInner {
				state: None,
				lifecycle: Lifecycle::Nonexistent,
				generation: Uuid::new_v4(),
				instance: None,
				kv: None,
				loaded: false,
				stop_rx: None,
			}),
			load_lock: tokio::sync::Mutex::new(()),
			start_lock: tokio::sync::Mutex::new(()),
			write_chain: Arc::new(tokio::sync::Mutex::new(())),
		})
	}

	pub fn lifecycle(&self) -> Lifecycle {
		self.inner.lock().lifecycle
	}

	pub fn generation(&self) -> Uuid {
		self.inner.lock().generation
	}

	pub fn state(&self) -> Option<PersistedActor> {
		self.inner.lock().state.clone()
	}

	pub fn state_exists(&self) -> bool {
		self.inner.lock().state.is_some()
	}

	pub fn instance(&self) -> Option<Arc<Instance>> {
		self.inner.lock().instance.clone()
	}

	pub(crate) fn kv(&self) -> Option<KvDb> {
		self.inner.lock().kv.clone()
	}

	pub fn is_stopping(&self) -> bool {
		matches!(
			self.lifecycle(),
			Lifecycle::StartingSleep | Lifecycle::StartingDestroy
		)
	}

	pub(crate) fn stop_rx(&self) -> Option<watch::Receiver<bool>> {
		self.inner.lock().stop_rx.clone()
	}

	/// Waits for any in-flight sleep or destroy to finish.
	pub(crate) async fn wait_stopped(&self) {
		loop {
			let Some(mut rx) = self.stop_rx() else {
				return;
			};
			if *rx.borrow() {
				return;
			}
			// The sender resolves the watch when the transition completes; a
			// dropped sender also unblocks us.
			let _ = rx.changed().await;
		}
	}

	/// Guard handed to the persistence layer: the rename only commits when
	/// the write's generation is still current and the actor is not being
	/// destroyed.
	pub(crate) fn write_guard(
		self: &Arc<Self>,
		generation: Uuid,
	) -> impl FnOnce() -> WriteGuardOutcome + Send + 'static {
		let entry = self.clone();
		move || {
			let inner = entry.inner.lock();
			if inner.generation == generation && inner.lifecycle != Lifecycle::StartingDestroy {
				WriteGuardOutcome::Commit
			} else {
				WriteGuardOutcome::Abort
			}
		}
	}
}
