use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use cleat_client_protocol::encoding::{self, Encoding, OutgoingFrame};
use cleat_client_protocol::{EventMessage, ToClient};
use cleat_error::ErrorParts;
use cleat_gateway_core::WebSocketHandle;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
	Prepared,
	Connected,
	Disconnected,
}

/// Identifies a hibernatable connection across process restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HibernationKey {
	pub gateway_id: Vec<u8>,
	pub request_id: Vec<u8>,
}

/// Prepared connection state persisted for hibernatable connections so a
/// restore after a cold start can skip the prepare stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedConn {
	pub encoding: String,
	pub params: Value,
	pub conn_state: Option<Value>,
	pub subscriptions: Vec<String>,
}

/// One client connection to an actor.
pub struct Connection {
	pub conn_id: u64,
	pub encoding: Encoding,
	pub params: Value,
	pub hibernation: Option<HibernationKey>,
	max_outgoing: usize,
	socket: Mutex<Option<WebSocketHandle>>,
	status: Mutex<ConnStatus>,
	subscriptions: Mutex<HashSet<String>>,
	conn_state: Mutex<Option<Value>>,
	last_pong: Mutex<Instant>,
	/// Cancels the liveness task and read loop on disconnect.
	pub(crate) closed: CancellationToken,
}

impl Connection {
	pub fn status(&self) -> ConnStatus {
		*self.status.lock()
	}

	pub fn is_connected(&self) -> bool {
		self.status() == ConnStatus::Connected
	}

	pub(crate) fn set_status(&self, status: ConnStatus) {
		*self.status.lock() = status;
	}

	pub(crate) fn attach_socket(&self, socket: WebSocketHandle) {
		*self.socket.lock() = Some(socket);
	}

	pub(crate) fn take_socket(&self) -> Option<WebSocketHandle> {
		self.socket.lock().take()
	}

	fn socket(&self) -> Option<WebSocketHandle> {
		self.socket.lock().clone()
	}

	pub fn conn_state(&self) -> Option<Value> {
		self.conn_state.lock().clone()
	}

	pub fn set_conn_state(&self, state: Value) {
		*self.conn_state.lock() = Some(state);
	}

	pub fn subscriptions(&self) -> Vec<String> {
		self.subscriptions.lock().iter().cloned().collect()
	}

	pub fn is_subscribed(&self, event_name: &str) -> bool {
		self.subscriptions.lock().contains(event_name)
	}

	/// Returns whether membership changed.
	pub(crate) fn set_subscribed(&self, event_name: &str, subscribe: bool) -> bool {
		let mut subscriptions = self.subscriptions.lock();
		if subscribe {
			subscriptions.insert(event_name.to_string())
		} else {
			subscriptions.remove(event_name)
		}
	}

	pub(crate) fn touch_pong(&self) {
		*self.last_pong.lock() = Instant::now();
	}

	pub(crate) fn last_pong(&self) -> Instant {
		*self.last_pong.lock()
	}

	pub(crate) fn to_persisted(&self) -> PersistedConn {
		PersistedConn {
			encoding: self.encoding.as_str().to_string(),
			params: self.params.clone(),
			conn_state: self.conn_state(),
			subscriptions: self.subscriptions(),
		}
	}

	/// Sends an already-encoded frame, enforcing the outgoing size limit.
	pub(crate) async fn send_frame(&self, frame: &OutgoingFrame) -> Result<()> {
		if frame.len() > self.max_outgoing {
			return Err(errors::Message::OutgoingTooLong {
				size: frame.len(),
				max: self.max_outgoing,
			}
			.build());
		}

		let socket = self
			.socket()
			.context("connection has no attached socket")?;
		socket.send_frame(frame).await
	}

	/// Encodes and sends a protocol message in this connection's encoding.
	pub(crate) async fn send_message(&self, msg: ToClient) -> Result<()> {
		let frame = encoding::encode_to_client(self.encoding, msg)?;
		self.send_frame(&frame).await
	}

	pub(crate) async fn send_ping(&self) -> Result<()> {
		let socket = self
			.socket()
			.context("connection has no attached socket")?;
		socket.ping().await
	}
}

/// User-facing view of a connection, handed to hooks.
#[derive(Clone)]
pub struct ConnHandle {
	pub(crate) conn: Arc<Connection>,
}

impl ConnHandle {
	pub fn id(&self) -> u64 {
		self.conn.conn_id
	}

	pub fn params(&self) -> Value {
		self.conn.params.clone()
	}

	pub fn state(&self) -> Option<Value> {
		self.conn.conn_state()
	}

	pub fn set_state(&self, state: Value) {
		self.conn.set_conn_state(state);
	}

	pub fn is_subscribed(&self, event_name: &str) -> bool {
		self.conn.is_subscribed(event_name)
	}

	/// Sends an event to this connection only, regardless of subscriptions.
	pub async fn send_event(&self, name: impl Into<String>, args: Vec<Value>) -> Result<()> {
		self.conn
			.send_message(ToClient::Event(EventMessage {
				name: name.into(),
				args,
			}))
			.await
	}
}

/// An event payload serialized at most once per encoding, on first demand.
pub struct CachedMessage {
	msg: ToClient,
	cache: Mutex<HashMap<Encoding, Arc<OutgoingFrame>>>,
}

impl CachedMessage {
	pub fn new(msg: ToClient) -> Self {
		CachedMessage {
			msg,
			cache: Mutex::new(HashMap::new()),
		}
	}

	pub fn frame_for(&self, encoding: Encoding) -> Result<Arc<OutgoingFrame>> {
		if let Some(frame) = self.cache.lock().get(&encoding) {
			return Ok(frame.clone());
		}

		let frame = Arc::new(encoding::encode_to_client(encoding, self.msg.clone())?);
		self.cache.lock().insert(encoding, frame.clone());
		Ok(frame)
	}
}

/// Holds every connection of one actor instance.
pub struct ConnManager {
	conns: Mutex<HashMap<u64, Arc<Connection>>>,
	next_conn_id: AtomicU64,
	max_outgoing: usize,
}

impl ConnManager {
	pub fn new(max_outgoing: usize) -> Self {
		ConnManager {
			conns: Mutex::new(HashMap::new()),
			next_conn_id: AtomicU64::new(1),
			max_outgoing,
		}
	}

	/// Creates a connection in the `Prepared` stage.
	pub fn create(
		&self,
		encoding: Encoding,
		params: Value,
		hibernation: Option<HibernationKey>,
	) -> Arc<Connection> {
		let conn = Arc::new(Connection {
			conn_id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
			encoding,
			params,
			hibernation,
			max_outgoing: self.max_outgoing,
			socket: Mutex::new(None),
			status: Mutex::new(ConnStatus::Prepared),
			subscriptions: Mutex::new(HashSet::new()),
			conn_state: Mutex::new(None),
			last_pong: Mutex::new(Instant::now()),
			closed: CancellationToken::new(),
		});
		self.conns.lock().insert(conn.conn_id, conn.clone());
		conn
	}

	pub fn get(&self, conn_id: u64) -> Option<Arc<Connection>> {
		self.conns.lock().get(&conn_id).cloned()
	}

	pub fn remove(&self, conn_id: u64) -> Option<Arc<Connection>> {
		self.conns.lock().remove(&conn_id)
	}

	pub fn all(&self) -> Vec<Arc<Connection>> {
		self.conns.lock().values().cloned().collect()
	}

	pub fn connected_count(&self) -> usize {
		self.conns
			.lock()
			.values()
			.filter(|conn| conn.is_connected())
			.count()
	}

	/// Finds a prepared hibernatable connection by its restore identifiers.
	pub fn find_hibernated(&self, gateway_id: &[u8], request_id: &[u8]) -> Option<Arc<Connection>> {
		self.conns
			.lock()
			.values()
			.find(|conn| {
				conn.hibernation.as_ref().is_some_and(|key| {
					key.gateway_id == gateway_id && key.request_id == request_id
				})
			})
			.cloned()
	}

	/// Serializes the payload once per encoding and fans it out to every
	/// connected subscriber. Send failures are logged per connection and do
	/// not stop the fan-out.
	#[tracing::instrument(skip_all, fields(event = %event_name))]
	pub async fn broadcast(&self, event_name: &str, args: Vec<Value>) -> Result<()> {
		let cached = CachedMessage::new(ToClient::Event(EventMessage {
			name: event_name.to_string(),
			args,
		}));

		let targets: Vec<_> = self
			.conns
			.lock()
			.values()
			.filter(|conn| conn.is_connected() && conn.is_subscribed(event_name))
			.cloned()
			.collect();

		for conn in targets {
			let frame = cached.frame_for(conn.encoding)?;
			if let Err(err) = conn.send_frame(&frame).await {
				tracing::warn!(conn_id = conn.conn_id, ?err, "failed to deliver event");
			}
		}

		Ok(())
	}
}
