use std::net::SocketAddr;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use cleat_core::{HibernationKey, Manager};
use cleat_error::{CleatError, ErrorParts};
use cleat_gateway_core::WebSocketHandle;
use cleat_gateway_core::subprotocol::{self, NegotiatedProtocols};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, SEC_WEBSOCKET_PROTOCOL};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, header};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Headers carrying the hibernation identity assigned by an upstream
/// gateway, base64-encoded.
const GATEWAY_ID_HEADER: &str = "x-cleat-gateway-id";
const REQUEST_ID_HEADER: &str = "x-cleat-request-id";

const ACTORS_PREFIX: &str = "/actors/";

/// Binds the gateway listener and spawns the accept loop.
pub(crate) async fn serve(
	manager: Manager,
	shutdown: CancellationToken,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
	let config = manager.registry().config().clone();
	let bind_addr = format!("{}:{}", config.gateway.host(), config.gateway.port());
	let listener = TcpListener::bind(&bind_addr)
		.await
		.with_context(|| format!("failed to bind gateway: {bind_addr}"))?;
	let addr = listener.local_addr()?;

	let join = tokio::spawn(accept_loop(listener, manager, shutdown));

	Ok((addr, join))
}

async fn accept_loop(listener: TcpListener, manager: Manager, shutdown: CancellationToken) {
	loop {
		let (stream, peer) = tokio::select! {
			_ = shutdown.cancelled() => return,
			accepted = listener.accept() => match accepted {
				Ok(accepted) => accepted,
				Err(err) => {
					tracing::warn!(?err, "gateway accept failed");
					continue;
				}
			},
		};

		let manager = manager.clone();
		let conn_shutdown = shutdown.clone();
		tokio::spawn(async move {
			let io = TokioIo::new(stream);
			let service = service_fn(move |req| {
				let manager = manager.clone();
				async move {
					Ok::<_, std::convert::Infallible>(handle_request(manager, req).await)
				}
			});

			let conn = hyper::server::conn::http1::Builder::new()
				.serve_connection(io, service)
				.with_upgrades();

			tokio::select! {
				res = conn => {
					if let Err(err) = res {
						tracing::debug!(%peer, ?err, "gateway connection error");
					}
				}
				_ = conn_shutdown.cancelled() => {}
			}
		});
	}
}

async fn handle_request(manager: Manager, req: Request<Incoming>) -> Response<Full<Bytes>> {
	let expose = manager
		.registry()
		.config()
		.runtime
		.expose_internal_errors();

	match route_request(manager, req).await {
		Ok(response) => response,
		Err(err) => error_response(&err, expose),
	}
}

async fn route_request(manager: Manager, mut req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
	let path = req.uri().path().to_string();
	let (actor_id, rest) = parse_actor_path(&path)?;

	if hyper_tungstenite::is_upgrade_request(&req) {
		// Reject bad routes before committing to the upgrade.
		Manager::resolve_ws_route(&rest)?;

		let protocols = negotiated_protocols(req.headers())?;
		let hibernation = hibernation_key(req.headers())?;

		let (mut response, websocket) =
			hyper_tungstenite::upgrade(&mut req, None).context("websocket upgrade failed")?;
		if let Some(selected) = &protocols.selected {
			response.headers_mut().insert(
				SEC_WEBSOCKET_PROTOCOL,
				selected.parse().context("invalid selected subprotocol")?,
			);
		}

		tokio::spawn(async move {
			let ws = match WebSocketHandle::new(websocket).await {
				Ok(ws) => ws,
				Err(err) => {
					tracing::debug!(?err, "websocket handshake failed");
					return;
				}
			};

			if let Err(err) = manager
				.open_websocket(&rest, &actor_id, ws.clone(), protocols, hibernation)
				.await
			{
				// Session-level rejections close the socket with the error's
				// taxonomy code as the reason.
				let extracted = CleatError::extract(&err);
				tracing::debug!(code = %extracted.code_path(), ?err, "websocket session rejected");
				ws.close_with_code(extracted.code_path()).await;
			}
		});

		return Ok(response);
	}

	let (parts, body) = req.into_parts();
	let body = body
		.collect()
		.await
		.context("failed to read request body")?
		.to_bytes();

	let mut builder = Request::builder().method(parts.method).uri(&rest);
	for (name, value) in parts.headers.iter() {
		builder = builder.header(name, value);
	}
	let forwarded = builder
		.body(Full::new(body))
		.context("failed to build forwarded request")?;

	manager.send_request(&actor_id, forwarded).await
}

/// Splits `/actors/{actor_id}{rest}` into its parts.
fn parse_actor_path(path: &str) -> Result<(String, String)> {
	let stripped = path
		.strip_prefix(ACTORS_PREFIX)
		.ok_or_else(|| cleat_core::errors::Actor::NotFound.build())?;

	let (actor_id, rest) = match stripped.find('/') {
		Some(idx) => (&stripped[..idx], &stripped[idx..]),
		None => (stripped, "/"),
	};
	if actor_id.is_empty() {
		return Err(cleat_core::errors::Actor::NotFound.build());
	}

	Ok((actor_id.to_string(), rest.to_string()))
}

fn negotiated_protocols(headers: &HeaderMap) -> Result<NegotiatedProtocols> {
	let mut combined = String::new();
	for value in headers.get_all(SEC_WEBSOCKET_PROTOCOL) {
		let value = value.to_str().context("invalid subprotocol header")?;
		if !combined.is_empty() {
			combined.push(',');
		}
		combined.push_str(value);
	}

	subprotocol::parse_protocols(&combined)
}

fn hibernation_key(headers: &HeaderMap) -> Result<Option<HibernationKey>> {
	let gateway_id = headers.get(GATEWAY_ID_HEADER);
	let request_id = headers.get(REQUEST_ID_HEADER);

	let (Some(gateway_id), Some(request_id)) = (gateway_id, request_id) else {
		return Ok(None);
	};

	let gateway_id = BASE64
		.decode(gateway_id.as_bytes())
		.context("invalid gateway id header")?;
	let request_id = BASE64
		.decode(request_id.as_bytes())
		.context("invalid request id header")?;

	Ok(Some(HibernationKey {
		gateway_id,
		request_id,
	}))
}

fn error_response(err: &anyhow::Error, expose_internal: bool) -> Response<Full<Bytes>> {
	let extracted = CleatError::extract(err);
	let message = if expose_internal {
		extracted
			.internal_message
			.clone()
			.unwrap_or_else(|| extracted.message.clone())
	} else {
		extracted.message.clone()
	};

	let body = serde_json::json!({
		"error": {
			"group": extracted.group,
			"code": extracted.code,
			"message": message,
			"metadata": extracted.metadata,
		}
	});
	let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());

	Response::builder()
		.status(StatusCode::from_u16(extracted.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
		.header(header::CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(bytes)))
		.unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
