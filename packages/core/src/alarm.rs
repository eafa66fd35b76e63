use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use cleat_store::{AlarmRecord, Store};
use cleat_util::long_timeout::{self, LongTimeoutResult};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;

struct AlarmTimer {
	timestamp_ms: i64,
	cancel: CancellationToken,
}

/// Long-horizon persistent timer per actor. At most one alarm is scheduled
/// per actor; a new request only replaces the timer when it is strictly
/// earlier.
pub struct AlarmScheduler {
	store: Store,
	registry: Arc<Registry>,
	timers: Mutex<HashMap<String, AlarmTimer>>,
	shutdown: CancellationToken,
}

impl AlarmScheduler {
	pub fn new(store: Store, registry: Arc<Registry>) -> Arc<Self> {
		let scheduler = Arc::new(AlarmScheduler {
			store,
			registry: registry.clone(),
			timers: Mutex::new(HashMap::new()),
			shutdown: CancellationToken::new(),
		});
		registry.set_alarms(Arc::downgrade(&scheduler));
		scheduler
	}

	/// Re-arms every alarm found on disk. Called once at startup; fired
	/// alarms for missed deadlines go off immediately.
	#[tracing::instrument(skip_all)]
	pub async fn recover(self: &Arc<Self>) -> Result<()> {
		let records = self.store.list_alarms().await?;
		let count = records.len();
		for record in records {
			self.arm(record.actor_id, record.timestamp_ms);
		}
		if count > 0 {
			tracing::info!(count, "recovered persisted alarms");
		}
		Ok(())
	}

	/// Persists and schedules an alarm. Earlier-or-equal existing alarms win;
	/// a stopping actor skips the request entirely.
	#[tracing::instrument(skip(self))]
	pub async fn set_actor_alarm(self: &Arc<Self>, actor_id: &str, timestamp_ms: i64) -> Result<()> {
		let entry = self.registry.load_actor(actor_id).await?;
		if entry.is_stopping() {
			tracing::debug!(actor_id, "skipping alarm for stopping actor");
			return Ok(());
		}

		let record = AlarmRecord {
			actor_id: actor_id.to_string(),
			timestamp_ms,
		};
		let generation = entry.generation();
		let written = self
			.store
			.write_alarm(&record, entry.write_guard(generation))
			.await?;
		if !written {
			tracing::debug!(actor_id, "alarm write superseded, not scheduling");
			return Ok(());
		}

		self.arm(actor_id.to_string(), timestamp_ms);
		Ok(())
	}

	/// Installs the in-memory timer if it beats the existing one.
	fn arm(self: &Arc<Self>, actor_id: String, timestamp_ms: i64) {
		let cancel = {
			let mut timers = self.timers.lock();
			if let Some(existing) = timers.get(&actor_id) {
				if existing.timestamp_ms <= timestamp_ms {
					return;
				}
				existing.cancel.cancel();
			}

			let cancel = self.shutdown.child_token();
			timers.insert(
				actor_id.clone(),
				AlarmTimer {
					timestamp_ms,
					cancel: cancel.clone(),
				},
			);
			cancel
		};

		let scheduler = self.clone();
		tokio::spawn(async move {
			if long_timeout::sleep_until_ms(timestamp_ms, &cancel).await
				== LongTimeoutResult::Cancelled
			{
				return;
			}

			// Drop the timer slot before firing so the hook can schedule the
			// next alarm.
			{
				let mut timers = scheduler.timers.lock();
				if timers
					.get(&actor_id)
					.is_some_and(|timer| timer.timestamp_ms == timestamp_ms)
				{
					timers.remove(&actor_id);
				}
			}

			if let Err(err) = scheduler.fire(&actor_id).await {
				tracing::error!(actor_id = %actor_id, ?err, "alarm handler failed");
			}
		});
	}

	/// Fire path: delete the alarm file, make sure the actor exists and is
	/// running, then run its alarm hook as a serial operation.
	#[tracing::instrument(skip(self))]
	async fn fire(self: &Arc<Self>, actor_id: &str) -> Result<()> {
		self.store.delete_alarm(actor_id).await?;

		let entry = self.registry.load_actor(actor_id).await?;
		if !entry.state_exists() {
			tracing::warn!(actor_id, "alarm fired for actor without state");
			return Ok(());
		}

		let instance = self
			.registry
			.start_actor(actor_id)
			.await
			.context("failed to start actor for alarm")?;

		instance.run_alarm_hook().await
	}

	/// Drops the in-memory timer; the alarm file is handled by the caller
	/// (destroy deletes all actor files).
	pub(crate) fn cancel_timer(&self, actor_id: &str) {
		if let Some(timer) = self.timers.lock().remove(actor_id) {
			timer.cancel.cancel();
		}
	}

	/// Cancels every timer. Pending alarm files stay on disk for the next
	/// process to recover.
	pub fn shutdown(&self) {
		self.shutdown.cancel();
		self.timers.lock().clear();
	}
}
