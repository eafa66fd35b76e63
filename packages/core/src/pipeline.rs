use std::sync::Arc;

use anyhow::Result;
use cleat_client_protocol::{
	ActionResponse, ErrorBody, ToClient, ToServer, encoding::Encoding,
};
use cleat_error::{CleatError, ErrorParts};
use cleat_gateway_core::WebSocketHandle;
use futures_util::StreamExt;
use hyper_tungstenite::tungstenite::Message as WsMessage;

use crate::conn::Connection;
use crate::definition::InvokeTarget;
use crate::errors;
use crate::instance::Instance;

/// Renders an error into a wire frame. Only the client-safe message is
/// exposed unless the runtime is configured for development.
pub(crate) fn error_body(
	err: &anyhow::Error,
	expose_internal: bool,
	action_id: Option<u64>,
) -> ErrorBody {
	let extracted = CleatError::extract(err);
	let message = if expose_internal {
		extracted
			.internal_message
			.clone()
			.unwrap_or_else(|| extracted.message.clone())
	} else {
		extracted.message.clone()
	};

	ErrorBody {
		group: extracted.group,
		code: extracted.code,
		message,
		metadata: extracted.metadata,
		action_id,
	}
}

/// Runs the protocol-framed session for one connection: reads frames in
/// order, dispatching each to completion before the next, so a subscription
/// update can never interleave with the action behind it.
#[tracing::instrument(skip_all, fields(actor_id = %instance.actor_id, conn_id = conn.conn_id))]
pub(crate) async fn run_connect_session(
	instance: &Arc<Instance>,
	conn: &Arc<Connection>,
	ws: WebSocketHandle,
) {
	let mut rx = match ws.take_receiver() {
		Ok(rx) => rx,
		Err(err) => {
			tracing::warn!(conn_id = conn.conn_id, ?err, "cannot run session without reader");
			instance.disconnect_conn(conn, false).await;
			return;
		}
	};

	loop {
		let msg = tokio::select! {
			_ = conn.closed.cancelled() => break,
			_ = instance.abort.cancelled() => break,
			msg = rx.next() => msg,
		};

		let Some(msg) = msg else {
			break;
		};
		let msg = match msg {
			Ok(msg) => msg,
			Err(err) => {
				tracing::debug!(?err, "websocket read failed");
				break;
			}
		};

		match msg {
			WsMessage::Text(text) => {
				if conn.encoding == Encoding::Json {
					handle_frame(instance, conn, text.as_bytes()).await;
				} else {
					send_error(
						instance,
						conn,
						&errors::Message::Malformed {
							reason: "expected a binary frame for this encoding".to_string(),
						}
						.build(),
						None,
					)
					.await;
				}
			}
			WsMessage::Binary(buf) => {
				if conn.encoding.is_binary() {
					handle_frame(instance, conn, &buf).await;
				} else {
					send_error(
						instance,
						conn,
						&errors::Message::Malformed {
							reason: "expected a text frame for the json encoding".to_string(),
						}
						.build(),
						None,
					)
					.await;
				}
			}
			WsMessage::Pong(_) => conn.touch_pong(),
			WsMessage::Close(_) => break,
			WsMessage::Ping(_) | WsMessage::Frame(_) => {}
		}
	}

	// A loop exit driven by the actor stopping keeps hibernatable prepared
	// state around; a client-side close removes it.
	let hibernate = instance.abort.is_cancelled() && conn.hibernation.is_some();
	instance.disconnect_conn(conn, hibernate).await;
}

/// Decodes and dispatches a single incoming frame, sending whatever response
/// it produces.
pub(crate) async fn handle_frame(instance: &Arc<Instance>, conn: &Arc<Connection>, payload: &[u8]) {
	let max = instance.config().gateway.max_incoming_message_size();
	if payload.len() > max {
		let err = errors::Message::IncomingTooLong {
			size: payload.len(),
			max,
		}
		.build();
		send_error(instance, conn, &err, None).await;
		return;
	}

	let msg = match cleat_client_protocol::encoding::decode_to_server(conn.encoding, payload) {
		Ok(msg) => msg,
		Err(err) => {
			let err = errors::Message::Malformed {
				reason: format!("{err:#}"),
			}
			.build();
			send_error(instance, conn, &err, None).await;
			return;
		}
	};

	match msg {
		ToServer::ActionRequest(req) => {
			let action_id = req.id;
			match dispatch_action_request(instance, req.name, req.args).await {
				Ok(output) => {
					let response = ToClient::ActionResponse(ActionResponse {
						// The request id round-trips unchanged.
						id: action_id,
						output,
					});
					if let Err(err) = conn.send_message(response).await {
						send_error(instance, conn, &err, Some(action_id)).await;
					}
				}
				Err(err) => send_error(instance, conn, &err, Some(action_id)).await,
			}
		}
		ToServer::SubscriptionRequest(req) => {
			if let Err(err) = handle_subscription(instance, conn, &req.event_name, req.subscribe).await
			{
				send_error(instance, conn, &err, None).await;
			}
		}
	}
}

async fn dispatch_action_request(
	instance: &Arc<Instance>,
	name: String,
	args: serde_json::Value,
) -> Result<serde_json::Value> {
	authorize(instance, InvokeTarget::Action { name: name.clone() }).await?;
	instance.dispatch_action(&name, args).await
}

async fn handle_subscription(
	instance: &Arc<Instance>,
	conn: &Arc<Connection>,
	event_name: &str,
	subscribe: bool,
) -> Result<()> {
	if subscribe {
		authorize(
			instance,
			InvokeTarget::Subscribe {
				name: event_name.to_string(),
			},
		)
		.await?;
	}

	conn.set_subscribed(event_name, subscribe);

	// Keep the prepared state of hibernatable connections current so a
	// restore resumes with the same subscriptions.
	if conn.hibernation.is_some() {
		instance.persist_hibernation(conn).await?;
	}

	Ok(())
}

/// Runs the authorization hook, when defined, ahead of the target.
async fn authorize(instance: &Arc<Instance>, target: InvokeTarget) -> Result<()> {
	let Some(hook) = instance.definition.hooks.can_invoke.clone() else {
		return Ok(());
	};

	let allowed = hook(instance.context(), target).await?;
	if !allowed {
		return Err(errors::Auth::Forbidden.build());
	}
	Ok(())
}

async fn send_error(
	instance: &Arc<Instance>,
	conn: &Arc<Connection>,
	err: &anyhow::Error,
	action_id: Option<u64>,
) {
	let expose = instance.config().runtime.expose_internal_errors();
	let body = error_body(err, expose, action_id);
	tracing::debug!(
		actor_id = %instance.actor_id,
		conn_id = conn.conn_id,
		code = %format!("{}.{}", body.group, body.code),
		"sending error frame"
	);

	if let Err(send_err) = conn.send_message(ToClient::Error(body)).await {
		tracing::warn!(conn_id = conn.conn_id, ?send_err, "failed to send error frame");
	}
}
