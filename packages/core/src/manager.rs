use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use cleat_error::ErrorParts;
use cleat_gateway_core::WebSocketHandle;
use cleat_gateway_core::subprotocol::{self, NegotiatedProtocols};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Response, StatusCode, header};
use serde::Serialize;
use serde_json::Value;

use crate::conn::HibernationKey;
use crate::entry::Lifecycle;
use crate::errors;
use crate::instance::Instance;
use crate::pipeline;
use crate::registry::Registry;

/// Actor-local HTTP paths served under the gateway prefix.
const HEALTH_PATH: &str = "/health";
const ACTION_PREFIX: &str = "/action/";
const REQUEST_PREFIX: &str = "/request";

/// WebSocket subpaths.
const CONNECT_PATH: &str = "/connect";
const RAW_WEBSOCKET_PREFIX: &str = "/raw-websocket";
const INSPECTOR_PATH: &str = "/inspector";

/// Public view of an actor's persisted record.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActorOutput {
	pub actor_id: String,
	pub name: String,
	pub key: Vec<String>,
	pub create_ts: i64,
	pub start_ts: Option<i64>,
	pub connectable_ts: Option<i64>,
	pub sleep_ts: Option<i64>,
}

impl ActorOutput {
	fn from_state(state: cleat_store::PersistedActor) -> Self {
		ActorOutput {
			actor_id: state.actor_id,
			name: state.name,
			key: state.key,
			create_ts: state.create_ts,
			start_ts: state.start_ts,
			connectable_ts: state.connectable_ts,
			sleep_ts: state.sleep_ts,
		}
	}
}

/// Which WebSocket subpath a session targets. Routing is strictly
/// prefix-based; the query string is stripped before comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsRoute {
	Connect,
	Raw { path: String },
	Inspector,
}

/// Routes `(name, key)` pairs to actors and proxies requests and WebSocket
/// sessions into them.
#[derive(Clone)]
pub struct Manager {
	registry: Arc<Registry>,
}

impl Manager {
	pub fn new(registry: Arc<Registry>) -> Self {
		Manager { registry }
	}

	pub fn registry(&self) -> &Arc<Registry> {
		&self.registry
	}

	/// Deterministic id for a `(name, key)` pair; the same pair always routes
	/// to the same actor with no lookup table.
	pub fn actor_id_for_key(name: &str, key: &[String]) -> String {
		cleat_util::id::actor_id_for_key(name, key)
	}

	#[tracing::instrument(skip(self))]
	pub async fn get_for_id(&self, actor_id: &str) -> Result<ActorOutput> {
		let entry = self.registry.load_actor(actor_id).await?;
		if entry.is_stopping() {
			return Err(errors::Actor::Stopping.build());
		}
		let Some(state) = entry.state() else {
			return Err(errors::Actor::NotFound.build());
		};
		Ok(ActorOutput::from_state(state))
	}

	pub async fn get_with_key(&self, name: &str, key: &[String]) -> Result<ActorOutput> {
		let actor_id = Self::actor_id_for_key(name, key);
		self.get_for_id(&actor_id).await
	}

	/// Get-or-create, eagerly starting the actor so `start_ts` is populated
	/// in the returned record.
	#[tracing::instrument(skip(self, input))]
	pub async fn get_or_create_with_key(
		&self,
		name: &str,
		key: &[String],
		input: Value,
	) -> Result<ActorOutput> {
		let actor_id = Self::actor_id_for_key(name, key);
		self.registry
			.load_or_create_actor(&actor_id, name, key, input)
			.await?;
		self.registry.start_actor(&actor_id).await?;
		self.get_for_id(&actor_id).await
	}

	#[tracing::instrument(skip(self, input))]
	pub async fn create_actor(&self, name: &str, key: &[String], input: Value) -> Result<ActorOutput> {
		let actor_id = Self::actor_id_for_key(name, key);
		self.registry
			.create_actor(&actor_id, name, key, input)
			.await?;
		self.registry.start_actor(&actor_id).await?;
		self.get_for_id(&actor_id).await
	}

	pub async fn destroy_actor(&self, actor_id: &str) -> Result<()> {
		self.registry.destroy_actor(actor_id).await
	}

	/// Actors with the given name, newest first. Iteration order over the
	/// registry is stabilized by id before sorting so ties break
	/// deterministically.
	pub fn list_actors(&self, name: &str) -> Vec<ActorOutput> {
		let mut actors: Vec<_> = self
			.registry
			.snapshot()
			.into_iter()
			.filter_map(|entry| entry.state())
			.filter(|state| state.name == name)
			.map(ActorOutput::from_state)
			.collect();
		actors.sort_by(|a, b| b.create_ts.cmp(&a.create_ts));
		actors
	}

	async fn started_instance(&self, actor_id: &str) -> Result<Arc<Instance>> {
		let entry = self.registry.load_actor(actor_id).await?;
		if entry.is_stopping() {
			return Err(errors::Actor::Stopping.build());
		}
		if !entry.state_exists() {
			return Err(errors::Actor::NotFound.build());
		}
		self.registry.start_actor(actor_id).await
	}

	/// Forwards an HTTP request to the actor-local router.
	#[tracing::instrument(skip(self, req), fields(path = %req.uri().path()))]
	pub async fn send_request(
		&self,
		actor_id: &str,
		req: Request<Full<Bytes>>,
	) -> Result<Response<Full<Bytes>>> {
		let path = req.uri().path().to_string();

		if path == HEALTH_PATH {
			return json_response(StatusCode::OK, &serde_json::json!({"status": "ok"}));
		}

		if let Some(action_name) = path.strip_prefix(ACTION_PREFIX) {
			if req.method() != Method::POST {
				return Err(errors::Action::InvalidRequest {
					reason: "actions must be invoked with POST".to_string(),
				}
				.build());
			}
			let action_name = action_name.to_string();

			let instance = self.started_instance(actor_id).await?;
			instance.begin_http_request();
			let res = self.invoke_action_http(&instance, &action_name, req).await;
			instance.end_http_request();
			return res;
		}

		if path == REQUEST_PREFIX || path.starts_with(&format!("{REQUEST_PREFIX}/")) {
			let instance = self.started_instance(actor_id).await?;
			let Some(hook) = instance.definition.hooks.on_request.clone() else {
				return Err(errors::Action::NotFound {
					name: "onRequest".to_string(),
				}
				.build());
			};

			instance.begin_http_request();
			let res = hook(instance.context(), req).await;
			instance.end_http_request();
			return res;
		}

		Err(errors::Actor::NotFound.build())
	}

	/// `proxy_request` routes identically to [`Manager::send_request`] but
	/// lets the caller rewrite the request first (e.g. stripping a gateway
	/// prefix).
	pub async fn proxy_request(
		&self,
		actor_id: &str,
		req: Request<Full<Bytes>>,
		rewrite: impl FnOnce(Request<Full<Bytes>>) -> Request<Full<Bytes>>,
	) -> Result<Response<Full<Bytes>>> {
		self.send_request(actor_id, rewrite(req)).await
	}

	async fn invoke_action_http(
		&self,
		instance: &Arc<Instance>,
		action_name: &str,
		req: Request<Full<Bytes>>,
	) -> Result<Response<Full<Bytes>>> {
		let body = req
			.into_body()
			.collect()
			.await
			.context("failed to read request body")?
			.to_bytes();
		let args: Value = if body.is_empty() {
			Value::Null
		} else {
			serde_json::from_slice(&body).map_err(|err| {
				errors::Action::InvalidRequest {
					reason: format!("body is not valid json: {err}"),
				}
				.build()
			})?
		};

		let output = instance.dispatch_action(action_name, args).await?;
		json_response(StatusCode::OK, &serde_json::json!({"output": output}))
	}

	/// Resolves the WebSocket subpath. The query string is stripped before
	/// the strictly prefix-based comparison.
	pub fn resolve_ws_route(path: &str) -> Result<WsRoute> {
		let path = path.split('?').next().unwrap_or(path);

		if path == CONNECT_PATH {
			Ok(WsRoute::Connect)
		} else if path == RAW_WEBSOCKET_PREFIX || path.starts_with(&format!("{RAW_WEBSOCKET_PREFIX}/"))
		{
			Ok(WsRoute::Raw {
				path: path.to_string(),
			})
		} else if path == INSPECTOR_PATH {
			Ok(WsRoute::Inspector)
		} else {
			Err(errors::Actor::NotFound.build())
		}
	}

	/// Opens a WebSocket session against an actor: a protocol-framed connect
	/// session, a raw socket handed to `on_websocket`, or the inspector.
	#[tracing::instrument(skip(self, ws, protocols, hibernation))]
	pub async fn open_websocket(
		&self,
		path: &str,
		actor_id: &str,
		ws: WebSocketHandle,
		protocols: NegotiatedProtocols,
		hibernation: Option<HibernationKey>,
	) -> Result<()> {
		match Self::resolve_ws_route(path)? {
			WsRoute::Connect => self.run_connect(actor_id, ws, protocols, hibernation).await,
			WsRoute::Raw { path } => {
				let instance = self.started_instance(actor_id).await?;
				let Some(hook) = instance.definition.hooks.on_websocket.clone() else {
					return Err(errors::Action::NotFound {
						name: "onWebSocket".to_string(),
					}
					.build());
				};
				hook(instance.context(), ws, path).await
			}
			WsRoute::Inspector => self.run_inspector(actor_id, ws, protocols).await,
		}
	}

	/// `proxy_websocket` routes identically to [`Manager::open_websocket`]
	/// but obtains the socket through the provided upgrade function.
	pub async fn proxy_websocket<F, Fut>(
		&self,
		path: &str,
		actor_id: &str,
		protocols: NegotiatedProtocols,
		hibernation: Option<HibernationKey>,
		upgrade: F,
	) -> Result<()>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<WebSocketHandle>>,
	{
		let ws = upgrade().await?;
		self.open_websocket(path, actor_id, ws, protocols, hibernation)
			.await
	}

	async fn run_connect(
		&self,
		actor_id: &str,
		ws: WebSocketHandle,
		protocols: NegotiatedProtocols,
		hibernation: Option<HibernationKey>,
	) -> Result<()> {
		let encoding = protocols.encoding.ok_or_else(|| {
			errors::EncodingError::Invalid {
				requested: "none negotiated".to_string(),
			}
			.build()
		})?;
		let params = protocols.conn_params.unwrap_or(Value::Null);

		let instance = self.started_instance(actor_id).await?;

		// Hibernatable connections whose prepared state survived skip the
		// prepare stage on restore.
		let restored = match &hibernation {
			Some(key) => {
				instance
					.restore_conn(&key.gateway_id, &key.request_id)
					.await?
			}
			None => None,
		};
		let conn = match restored {
			Some(conn) => conn,
			None => instance.prepare_conn(encoding, params, hibernation).await?,
		};

		instance.connect_conn(&conn, ws.clone()).await?;
		pipeline::run_connect_session(&instance, &conn, ws).await;

		Ok(())
	}

	async fn run_inspector(
		&self,
		actor_id: &str,
		ws: WebSocketHandle,
		protocols: NegotiatedProtocols,
	) -> Result<()> {
		let Some(expected) = self
			.registry
			.config()
			.gateway
			.inspector_token
			.as_deref()
		else {
			return Err(errors::Auth::Forbidden.build());
		};
		let provided = protocols.inspector_token.as_deref().unwrap_or("");
		if !subprotocol::token_matches(expected, provided) {
			return Err(errors::Auth::Forbidden.build());
		}

		let entry = self.registry.load_actor(actor_id).await?;
		let lifecycle = match entry.lifecycle() {
			Lifecycle::Nonexistent => "nonexistent",
			Lifecycle::Awake => "awake",
			Lifecycle::StartingSleep => "starting_sleep",
			Lifecycle::StartingDestroy => "starting_destroy",
			Lifecycle::Destroyed => "destroyed",
		};
		let connections = entry
			.instance()
			.map(|instance| instance.conns.connected_count())
			.unwrap_or(0);

		let doc = serde_json::json!({
			"actorId": entry.actor_id,
			"lifecycle": lifecycle,
			"exists": entry.state_exists(),
			"connections": connections,
		});
		ws.send(hyper_tungstenite::tungstenite::Message::Text(
			serde_json::to_string(&doc)
				.context("failed to serialize inspector document")?
				.into(),
		))
		.await?;
		ws.close().await;

		Ok(())
	}
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<Full<Bytes>>> {
	let bytes = serde_json::to_vec(body).context("failed to serialize response body")?;
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(bytes)))
		.context("failed to build response")
}
