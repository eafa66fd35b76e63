use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cleat_client_protocol::encoding::Encoding;
use cleat_config::Config;
use cleat_error::ErrorParts;
use cleat_gateway_core::WebSocketHandle;
use cleat_store::{KvDb, keys};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::conn::{ConnHandle, ConnManager, ConnStatus, Connection, HibernationKey, PersistedConn};
use crate::definition::ActorDefinition;
use crate::errors;
use crate::registry::Registry;
use crate::scheduler::{OpMode, OpScheduler};

/// Why an instance is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
	Sleep,
	Destroy,
}

/// How long a crashed actor waits before the scheduled restart.
pub(crate) const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// The loaded runtime for one actor: mirrored state, connections, the
/// operation scheduler, and the user-supplied definition.
pub struct Instance {
	pub actor_id: String,
	pub name: String,
	pub key: Vec<String>,
	config: Config,
	pub(crate) definition: Arc<ActorDefinition>,
	pub(crate) registry: Weak<Registry>,
	pub(crate) scheduler: OpScheduler,
	pub(crate) conns: ConnManager,
	/// Fires when the actor begins stopping.
	pub(crate) abort: CancellationToken,
	kv: KvDb,
	write_chain: Arc<tokio::sync::Mutex<()>>,
	state_mirror: Mutex<Value>,
	in_state_change: AtomicBool,
	keep_awake_holds: AtomicUsize,
	pending_http: AtomicUsize,
	last_activity: Mutex<Instant>,
	tracker: TaskTracker,
	run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Instance {
	/// Builds and starts the runtime object: loads the state mirror, runs the
	/// wake hook, then launches the `run` handler and the inactivity
	/// watchdog.
	#[tracing::instrument(skip_all, fields(actor_id = %actor_id))]
	pub(crate) async fn start(
		registry: &Arc<Registry>,
		actor_id: String,
		name: String,
		key: Vec<String>,
		definition: Arc<ActorDefinition>,
		kv: KvDb,
		write_chain: Arc<tokio::sync::Mutex<()>>,
	) -> Result<Arc<Self>> {
		let config = registry.config().clone();

		// The mirror makes state reads free for the lifetime of the instance.
		let state_mirror = {
			let slots = kv.batch_get(vec![keys::state_key()]).await?;
			match slots.into_iter().next().flatten() {
				Some(bytes) => {
					serde_json::from_slice(&bytes).context("corrupt state mirror record")?
				}
				None => Value::Null,
			}
		};

		let instance = Arc::new(Instance {
			actor_id,
			name,
			key,
			conns: ConnManager::new(config.gateway.max_outgoing_message_size()),
			config,
			definition,
			registry: Arc::downgrade(registry),
			scheduler: OpScheduler::new(),
			abort: CancellationToken::new(),
			kv,
			write_chain,
			state_mirror: Mutex::new(state_mirror),
			in_state_change: AtomicBool::new(false),
			keep_awake_holds: AtomicUsize::new(0),
			pending_http: AtomicUsize::new(0),
			last_activity: Mutex::new(Instant::now()),
			tracker: TaskTracker::new(),
			run_handle: Mutex::new(None),
		});

		if let Some(hook) = instance.definition.hooks.on_wake.clone() {
			let ctx = instance.context();
			tokio::time::timeout(instance.hook_timeout(), hook(ctx))
				.await
				.map_err(|_| errors::Action::TimedOut.build())
				.and_then(|res| res)
				.context("wake hook failed")?;
		}

		instance.spawn_run();
		instance.spawn_sleep_watchdog();

		Ok(instance)
	}

	/// A context over this instance, as handed to actions and hooks.
	pub fn context(self: &Arc<Self>) -> ActorContext {
		ActorContext {
			instance: self.clone(),
		}
	}

	pub(crate) fn config(&self) -> &Config {
		&self.config
	}

	fn action_timeout(&self) -> Duration {
		self.definition
			.options
			.action_timeout
			.unwrap_or_else(|| self.config.runtime.action_timeout())
	}

	fn hook_timeout(&self) -> Duration {
		self.config.runtime.hook_timeout()
	}

	fn sleep_timeout(&self) -> Duration {
		self.definition
			.options
			.sleep_timeout
			.unwrap_or_else(|| self.config.runtime.sleep_timeout())
	}

	fn no_sleep(&self) -> bool {
		self.definition
			.options
			.no_sleep
			.unwrap_or_else(|| self.config.runtime.no_sleep())
	}

	pub(crate) fn touch_activity(&self) {
		*self.last_activity.lock() = Instant::now();
	}

	fn last_activity(&self) -> Instant {
		*self.last_activity.lock()
	}

	/// Whether nothing is holding the actor awake right now.
	fn is_quiet(&self) -> bool {
		self.conns.connected_count() == 0
			&& self.scheduler.is_idle()
			&& self.keep_awake_holds.load(Ordering::SeqCst) == 0
			&& self.pending_http.load(Ordering::SeqCst) == 0
	}

	/// Runs an operation under the concurrency discipline with a timeout.
	/// The admission slot is held until the handler future is resolved or
	/// dropped.
	pub(crate) async fn run_operation<T>(
		&self,
		mode: OpMode,
		timeout: Duration,
		fut: impl Future<Output = Result<T>>,
	) -> Result<T> {
		let permit = tokio::select! {
			permit = self.scheduler.acquire(mode) => permit?,
			_ = self.abort.cancelled() => return Err(errors::Actor::Aborted.build()),
		};

		let res = tokio::select! {
			res = tokio::time::timeout(timeout, fut) => match res {
				Ok(res) => res,
				Err(_) => Err(errors::Action::TimedOut.build()),
			},
			_ = self.abort.cancelled() => Err(errors::Actor::Aborted.build()),
		};

		drop(permit);
		self.touch_activity();
		res
	}

	/// Dispatches a named action: admission, handler, then the response
	/// transform hook.
	#[tracing::instrument(skip_all, fields(actor_id = %self.actor_id, action = %name))]
	pub(crate) async fn dispatch_action(self: &Arc<Self>, name: &str, args: Value) -> Result<Value> {
		let action = self.definition.action(name).ok_or_else(|| {
			errors::Action::NotFound {
				name: name.to_string(),
			}
			.build()
		})?;

		let timeout = action.timeout.unwrap_or_else(|| self.action_timeout());
		let mode = action.mode;
		let handler = action.handler.clone();

		let ctx = self.context();
		let hook_args = args.clone();
		let output = self
			.run_operation(mode, timeout, handler(ctx.clone(), args))
			.await?;

		if let Some(hook) = self.definition.hooks.on_before_action_response.clone() {
			hook(ctx, name.to_string(), hook_args, output).await
		} else {
			Ok(output)
		}
	}

	/// Runs the alarm hook as a serial operation, matching the exclusivity of
	/// actions.
	pub(crate) async fn run_alarm_hook(self: &Arc<Self>) -> Result<()> {
		let Some(hook) = self.definition.hooks.on_alarm.clone() else {
			return Ok(());
		};
		let ctx = self.context();
		self.run_operation(OpMode::Serial, self.hook_timeout(), hook(ctx))
			.await
	}

	// == State mirror ==

	pub fn state(&self) -> Value {
		self.state_mirror.lock().clone()
	}

	/// Assigns the mirrored state: fires the change hook once (re-entrant
	/// assignment from inside the hook is suppressed) and persists through
	/// the write chain.
	pub(crate) async fn set_state_value(self: &Arc<Self>, new_state: Value) -> Result<()> {
		*self.state_mirror.lock() = new_state.clone();

		if let Some(hook) = self.definition.hooks.on_state_change.clone() {
			if !self.in_state_change.swap(true, Ordering::SeqCst) {
				let res = hook(self.context(), new_state).await;
				self.in_state_change.store(false, Ordering::SeqCst);
				res?;
			}
		}

		self.persist_state_mirror().await
	}

	async fn persist_state_mirror(&self) -> Result<()> {
		// Writes racing a stop are dropped silently; the mirror is already
		// updated and the stop owns the final persistence pass.
		if self.abort.is_cancelled() {
			return Ok(());
		}

		let bytes = serde_json::to_vec(&self.state())
			.map_err(|_| errors::State::InvalidType.build())?;

		let _chain = self.write_chain.lock().await;
		if self.abort.is_cancelled() {
			return Ok(());
		}
		self.kv
			.batch_put(vec![(keys::state_key(), bytes)])
			.await
	}

	// == User KV ==

	pub(crate) async fn kv_get(&self, kv_keys: Vec<Vec<u8>>) -> Result<Vec<Option<Vec<u8>>>> {
		if self.abort.is_cancelled() {
			return Err(errors::Actor::Stopping.build());
		}
		let kv_keys = kv_keys.iter().map(|k| keys::user_key(k)).collect();
		self.kv.batch_get(kv_keys).await
	}

	pub(crate) async fn kv_put(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
		// A put racing a stop silently no-ops.
		if self.abort.is_cancelled() {
			return Ok(());
		}
		let entries = entries
			.into_iter()
			.map(|(k, v)| (keys::user_key(&k), v))
			.collect();

		let _chain = self.write_chain.lock().await;
		if self.abort.is_cancelled() {
			return Ok(());
		}
		self.kv.batch_put(entries).await
	}

	pub(crate) async fn kv_delete(&self, kv_keys: Vec<Vec<u8>>) -> Result<()> {
		if self.abort.is_cancelled() {
			return Ok(());
		}
		let kv_keys = kv_keys.iter().map(|k| keys::user_key(k)).collect();

		let _chain = self.write_chain.lock().await;
		if self.abort.is_cancelled() {
			return Ok(());
		}
		self.kv.batch_delete(kv_keys).await
	}

	pub(crate) async fn kv_list_prefix(
		&self,
		prefix: Vec<u8>,
		limit: Option<usize>,
	) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		if self.abort.is_cancelled() {
			return Err(errors::Actor::Stopping.build());
		}
		let entries = self.kv.list_prefix(keys::user_key(&prefix), limit).await?;
		Ok(entries
			.into_iter()
			.filter_map(|(k, v)| keys::strip_user_key(&k).map(|k| (k.to_vec(), v)))
			.collect())
	}

	// == Connections ==

	/// Stage one of a connection: validation and conn-state creation, before
	/// the socket is attached.
	#[tracing::instrument(skip_all, fields(actor_id = %self.actor_id))]
	pub(crate) async fn prepare_conn(
		self: &Arc<Self>,
		encoding: Encoding,
		params: Value,
		hibernation: Option<HibernationKey>,
	) -> Result<Arc<Connection>> {
		let ctx = self.context();

		if let Some(hook) = self.definition.hooks.on_before_connect.clone() {
			tokio::time::timeout(self.hook_timeout(), hook(ctx.clone(), params.clone()))
				.await
				.map_err(|_| errors::Action::TimedOut.build())
				.and_then(|res| res)?;
		}

		let conn = self.conns.create(encoding, params.clone(), hibernation);

		if let Some(hook) = self.definition.hooks.create_conn_state.clone() {
			let conn_state = tokio::time::timeout(self.hook_timeout(), hook(ctx, params))
				.await
				.map_err(|_| errors::Action::TimedOut.build())
				.and_then(|res| res)?;
			conn.set_conn_state(conn_state);
		}

		self.persist_hibernation(&conn).await?;

		Ok(conn)
	}

	/// Stage two: the socket is open (or restored); run the connect hook and
	/// begin liveness tracking.
	#[tracing::instrument(skip_all, fields(actor_id = %self.actor_id, conn_id = conn.conn_id))]
	pub(crate) async fn connect_conn(
		self: &Arc<Self>,
		conn: &Arc<Connection>,
		socket: WebSocketHandle,
	) -> Result<()> {
		conn.attach_socket(socket);
		conn.touch_pong();
		conn.set_status(ConnStatus::Connected);
		self.touch_activity();

		if let Some(hook) = self.definition.hooks.on_connect.clone() {
			let handle = ConnHandle { conn: conn.clone() };
			tokio::time::timeout(self.hook_timeout(), hook(self.context(), handle))
				.await
				.map_err(|_| errors::Action::TimedOut.build())
				.and_then(|res| res)?;
		}

		self.spawn_liveness(conn.clone());

		Ok(())
	}

	/// Recovers a prepared hibernatable connection after a cold start, or
	/// returns the live one if the process never restarted.
	pub(crate) async fn restore_conn(
		self: &Arc<Self>,
		gateway_id: &[u8],
		request_id: &[u8],
	) -> Result<Option<Arc<Connection>>> {
		if let Some(conn) = self.conns.find_hibernated(gateway_id, request_id) {
			return Ok(Some(conn));
		}

		let key = keys::hibernation_key(gateway_id, request_id);
		let slots = self.kv.batch_get(vec![key]).await?;
		let Some(bytes) = slots.into_iter().next().flatten() else {
			return Ok(None);
		};

		let persisted: PersistedConn =
			serde_json::from_slice(&bytes).context("corrupt hibernation record")?;
		let encoding = Encoding::parse(&persisted.encoding)
			.context("hibernation record has unknown encoding")?;

		// Prepared state survived the restart; skip the prepare hooks.
		let conn = self.conns.create(
			encoding,
			persisted.params,
			Some(HibernationKey {
				gateway_id: gateway_id.to_vec(),
				request_id: request_id.to_vec(),
			}),
		);
		if let Some(state) = persisted.conn_state {
			conn.set_conn_state(state);
		}
		for event_name in persisted.subscriptions {
			conn.set_subscribed(&event_name, true);
		}

		Ok(Some(conn))
	}

	/// Tears a connection down. `hibernate` keeps the persisted prepared
	/// state so the driver can restore the connection later.
	#[tracing::instrument(skip_all, fields(actor_id = %self.actor_id, conn_id = conn.conn_id))]
	pub(crate) async fn disconnect_conn(self: &Arc<Self>, conn: &Arc<Connection>, hibernate: bool) {
		if conn.status() == ConnStatus::Disconnected {
			return;
		}
		conn.set_status(ConnStatus::Disconnected);
		conn.closed.cancel();
		self.conns.remove(conn.conn_id);

		if let Some(socket) = conn.take_socket() {
			socket.close().await;
		}

		if !hibernate {
			if let Some(key) = &conn.hibernation {
				let record_key = keys::hibernation_key(&key.gateway_id, &key.request_id);
				if let Err(err) = self.kv.batch_delete(vec![record_key]).await {
					tracing::warn!(?err, "failed to remove hibernation record");
				}
			}
		}

		if let Some(hook) = self.definition.hooks.on_disconnect.clone() {
			let handle = ConnHandle { conn: conn.clone() };
			let res = tokio::time::timeout(self.hook_timeout(), hook(self.context(), handle)).await;
			match res {
				Ok(Ok(())) => {}
				Ok(Err(err)) => tracing::warn!(?err, "disconnect hook failed"),
				Err(_) => tracing::warn!("disconnect hook timed out"),
			}
		}

		self.touch_activity();
	}

	/// Keeps the persisted prepared state of a hibernatable connection in
	/// sync with its live subscriptions and conn state.
	pub(crate) async fn persist_hibernation(&self, conn: &Arc<Connection>) -> Result<()> {
		let Some(key) = &conn.hibernation else {
			return Ok(());
		};
		let record_key = keys::hibernation_key(&key.gateway_id, &key.request_id);
		let bytes = serde_json::to_vec(&conn.to_persisted())
			.context("failed to serialize hibernation record")?;
		self.kv.batch_put(vec![(record_key, bytes)]).await
	}

	fn spawn_liveness(self: &Arc<Self>, conn: Arc<Connection>) {
		let instance = self.clone();
		let interval = self.config.gateway.connection_liveness_interval();
		let timeout = self.config.gateway.connection_liveness_timeout();

		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = conn.closed.cancelled() => return,
					_ = instance.abort.cancelled() => return,
					_ = tokio::time::sleep(interval) => {}
				}

				let ping_sent = Instant::now();
				if conn.send_ping().await.is_err() {
					instance.disconnect_conn(&conn, false).await;
					return;
				}

				tokio::select! {
					_ = conn.closed.cancelled() => return,
					_ = instance.abort.cancelled() => return,
					_ = tokio::time::sleep(timeout) => {}
				}

				if conn.last_pong() < ping_sent {
					tracing::debug!(conn_id = conn.conn_id, "connection failed liveness check");
					instance.disconnect_conn(&conn, false).await;
					return;
				}
			}
		});
	}

	// == Background work ==

	/// Holds the actor awake for the duration of `fut` and resets the
	/// inactivity timer when it completes.
	pub(crate) async fn keep_awake<T>(&self, fut: impl Future<Output = T>) -> T {
		self.keep_awake_holds.fetch_add(1, Ordering::SeqCst);
		let out = fut.await;
		self.keep_awake_holds.fetch_sub(1, Ordering::SeqCst);
		self.touch_activity();
		out
	}

	/// Tracks fire-and-forget work for the bounded shutdown drain.
	pub(crate) fn wait_until(&self, fut: impl Future<Output = ()> + Send + 'static) {
		self.tracker.spawn(fut);
	}

	pub(crate) fn begin_http_request(&self) {
		self.pending_http.fetch_add(1, Ordering::SeqCst);
	}

	pub(crate) fn end_http_request(&self) {
		self.pending_http.fetch_sub(1, Ordering::SeqCst);
		self.touch_activity();
	}

	fn spawn_run(self: &Arc<Self>) {
		let Some(run) = self.definition.run.clone() else {
			return;
		};
		let instance = self.clone();

		let handle = tokio::spawn(async move {
			let ctx = instance.context();
			let res = tokio::select! {
				res = run(ctx) => Some(res),
				_ = instance.abort.cancelled() => None,
			};

			// Finishing while the actor is alive is a crash, whether the
			// handler failed or just returned.
			if let Some(res) = res {
				match res {
					Ok(()) => {
						tracing::error!(actor_id = %instance.actor_id, "run handler returned early")
					}
					Err(err) => {
						tracing::error!(actor_id = %instance.actor_id, ?err, "run handler failed")
					}
				}

				if let Some(registry) = instance.registry.upgrade() {
					let actor_id = instance.actor_id.clone();
					// Stop from a fresh task; stopping joins this one.
					tokio::spawn(async move {
						registry.crash_actor(actor_id).await;
					});
				}
			}
		});

		*self.run_handle.lock() = Some(handle);
	}

	fn spawn_sleep_watchdog(self: &Arc<Self>) {
		if self.no_sleep() {
			return;
		}
		let instance = self.clone();
		let timeout = self.sleep_timeout();

		tokio::spawn(async move {
			loop {
				let deadline = instance.last_activity() + timeout;
				if Instant::now() >= deadline {
					if instance.is_quiet() {
						tracing::debug!(actor_id = %instance.actor_id, "actor idle, going to sleep");
						if let Some(registry) = instance.registry.upgrade() {
							if let Err(err) = registry.sleep_actor(&instance.actor_id).await {
								tracing::warn!(actor_id = %instance.actor_id, ?err, "self-sleep failed");
							}
						}
						return;
					}

					// Busy past the deadline: poll until activity moves it.
					tokio::select! {
						_ = instance.abort.cancelled() => return,
						_ = tokio::time::sleep(Duration::from_millis(25)) => {}
					}
				} else {
					tokio::select! {
						_ = instance.abort.cancelled() => return,
						_ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
					}
				}
			}
		});
	}

	/// Winds the instance down: rejects pending operations, runs the stop
	/// hook, disconnects clients, and drains background work within its
	/// budget. Called only by the registry's stop path.
	#[tracing::instrument(skip_all, fields(actor_id = %self.actor_id, reason = ?reason))]
	pub(crate) async fn stop(self: &Arc<Self>, reason: StopReason) {
		self.scheduler.close();
		self.abort.cancel();

		// Give `run` its budget to unwind cooperatively, then abandon it.
		let run_handle = self.run_handle.lock().take();
		if let Some(mut handle) = run_handle {
			if tokio::time::timeout(self.config.runtime.run_stop_timeout(), &mut handle)
				.await
				.is_err()
			{
				tracing::warn!(actor_id = %self.actor_id, "run handler did not stop in time");
				handle.abort();
			}
		}

		// Hibernatable connections keep their prepared state on sleep so the
		// driver can restore them; destroy drops everything.
		let hibernate = reason == StopReason::Sleep;
		for conn in self.conns.all() {
			let keep = hibernate && conn.hibernation.is_some();
			self.disconnect_conn(&conn, keep).await;
		}

		let hook = match reason {
			StopReason::Sleep => self.definition.hooks.on_sleep.clone(),
			StopReason::Destroy => self.definition.hooks.on_destroy.clone(),
		};
		if let Some(hook) = hook {
			let res = tokio::time::timeout(self.hook_timeout(), hook(self.context())).await;
			match res {
				Ok(Ok(())) => {}
				Ok(Err(err)) => tracing::warn!(?err, "stop hook failed"),
				Err(_) => tracing::warn!("stop hook timed out"),
			}
		}

		self.tracker.close();
		if tokio::time::timeout(self.config.runtime.wait_until_timeout(), self.tracker.wait())
			.await
			.is_err()
		{
			tracing::warn!(actor_id = %self.actor_id, "tracked tasks did not drain in time");
		}
	}
}

/// Handle passed to every action and hook; the user-facing API of a live
/// actor.
#[derive(Clone)]
pub struct ActorContext {
	pub(crate) instance: Arc<Instance>,
}

impl ActorContext {
	pub fn actor_id(&self) -> &str {
		&self.instance.actor_id
	}

	pub fn name(&self) -> &str {
		&self.instance.name
	}

	pub fn key(&self) -> &[String] {
		&self.instance.key
	}

	/// The in-memory state mirror. Reads are free.
	pub fn state(&self) -> Value {
		self.instance.state()
	}

	/// Assigns the actor state, firing `on_state_change` once and persisting
	/// through the write chain.
	pub async fn set_state(&self, state: Value) -> Result<()> {
		self.instance.set_state_value(state).await
	}

	pub async fn kv_get(&self, keys: Vec<Vec<u8>>) -> Result<Vec<Option<Vec<u8>>>> {
		self.instance.kv_get(keys).await
	}

	pub async fn kv_put(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
		self.instance.kv_put(entries).await
	}

	pub async fn kv_delete(&self, keys: Vec<Vec<u8>>) -> Result<()> {
		self.instance.kv_delete(keys).await
	}

	pub async fn kv_list_prefix(
		&self,
		prefix: Vec<u8>,
		limit: Option<usize>,
	) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		self.instance.kv_list_prefix(prefix, limit).await
	}

	/// Schedules (or tightens) the actor's alarm.
	pub async fn set_alarm(&self, timestamp_ms: i64) -> Result<()> {
		let registry = self
			.instance
			.registry
			.upgrade()
			.context("runtime is shutting down")?;
		let alarms = registry.alarms().context("alarm scheduler not running")?;
		alarms
			.set_actor_alarm(&self.instance.actor_id, timestamp_ms)
			.await
	}

	/// Publishes an event to every subscribed connection.
	pub async fn broadcast(&self, event_name: &str, args: Vec<Value>) -> Result<()> {
		self.instance.conns.broadcast(event_name, args).await
	}

	pub fn conn_count(&self) -> usize {
		self.instance.conns.connected_count()
	}

	/// Prevents inactivity sleep while `fut` runs.
	pub async fn keep_awake<T>(&self, fut: impl Future<Output = T>) -> T {
		self.instance.keep_awake(fut).await
	}

	/// Spawns fire-and-forget work that shutdown will wait (bounded) for.
	pub fn wait_until(&self, fut: impl Future<Output = ()> + Send + 'static) {
		self.instance.wait_until(fut);
	}

	/// Cancellation signal raised when the actor starts stopping. Handlers
	/// doing long work should observe it.
	pub fn abort_signal(&self) -> CancellationToken {
		self.instance.abort.clone()
	}
}
