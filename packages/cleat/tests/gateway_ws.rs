mod common;

use std::net::SocketAddr;
use std::time::Duration;

use cleat_client_protocol::encoding::{Encoding, cbor_decode, cbor_encode, event_args_from_wire};
use cleat_client_protocol::{
	ActionRequest, PROTOCOL_VERSION, SubscriptionRequest, ToClient, ToServer, v2, versioned,
};
use futures_util::{SinkExt, StreamExt};
use serde_bytes::ByteBuf;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use vbare::OwnedVersionedData;

type WsClient =
	tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: SocketAddr, actor_id: &str, path: &str, protocols: &str) -> WsClient {
	let url = format!("ws://{addr}/actors/{actor_id}{path}");
	let mut request = url.into_client_request().expect("build ws request");
	request.headers_mut().insert(
		"sec-websocket-protocol",
		protocols.parse().expect("valid protocol header"),
	);

	let (ws, _response) = tokio_tungstenite::connect_async(request)
		.await
		.expect("ws connect");
	ws
}

fn encode_to_server(encoding: Encoding, msg: &ToServer) -> Message {
	match encoding {
		Encoding::Json => Message::Text(serde_json::to_string(msg).unwrap().into()),
		Encoding::Cbor => {
			let mut buf = Vec::new();
			ciborium::ser::into_writer(msg, &mut buf).unwrap();
			Message::Binary(buf.into())
		}
		Encoding::Bare => {
			let wire = match msg {
				ToServer::ActionRequest(req) => v2::ToServer::ActionRequest(v2::ActionRequest {
					id: req.id,
					name: req.name.clone(),
					args: ByteBuf::from(cbor_encode(&req.args).unwrap()),
				}),
				ToServer::SubscriptionRequest(req) => {
					v2::ToServer::SubscriptionRequest(v2::SubscriptionRequest {
						event_name: req.event_name.clone(),
						subscribe: req.subscribe,
					})
				}
			};
			let buf = versioned::ToServer::wrap_latest(wire)
				.serialize_with_embedded_version(PROTOCOL_VERSION)
				.unwrap();
			Message::Binary(buf.into())
		}
	}
}

/// Normalized incoming frame for assertions.
#[derive(Debug, PartialEq)]
enum Incoming {
	Response { id: u64, output: Value },
	Event { name: String, args: Vec<Value> },
	Error { code_path: String, action_id: Option<u64> },
}

fn decode_to_client(encoding: Encoding, msg: Message) -> Incoming {
	let parsed = match (encoding, msg) {
		(Encoding::Json, Message::Text(text)) => serde_json::from_str::<ToClient>(&text).unwrap(),
		(Encoding::Cbor, Message::Binary(buf)) => {
			ciborium::de::from_reader::<ToClient, _>(buf.as_ref()).unwrap()
		}
		(Encoding::Bare, Message::Binary(buf)) => {
			let wire = versioned::ToClient::deserialize_with_embedded_version(&buf).unwrap();
			return match wire {
				v2::ToClient::ActionResponse(resp) => Incoming::Response {
					id: resp.id,
					output: cbor_decode(&resp.output).unwrap(),
				},
				v2::ToClient::Event(event) => Incoming::Event {
					name: event.name,
					args: event_args_from_wire(&event.args).unwrap(),
				},
				v2::ToClient::Error(err) => Incoming::Error {
					code_path: format!("{}.{}", err.group, err.code),
					action_id: err.action_id,
				},
			};
		}
		(_, msg) => panic!("unexpected frame kind for {encoding:?}: {msg:?}"),
	};

	match parsed {
		ToClient::ActionResponse(resp) => Incoming::Response {
			id: resp.id,
			output: resp.output,
		},
		ToClient::Event(event) => Incoming::Event {
			name: event.name,
			args: event.args,
		},
		ToClient::Error(err) => Incoming::Error {
			code_path: format!("{}.{}", err.group, err.code),
			action_id: err.action_id,
		},
	}
}

/// Reads frames until a data frame arrives, transparently answering pings.
async fn next_incoming(encoding: Encoding, ws: &mut WsClient) -> Incoming {
	loop {
		let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
			.await
			.expect("timed out waiting for frame")
			.expect("connection closed")
			.expect("ws error");
		match msg {
			Message::Ping(payload) => {
				ws.send(Message::Pong(payload)).await.unwrap();
			}
			Message::Pong(_) => {}
			msg => return decode_to_client(encoding, msg),
		}
	}
}

#[tokio::test]
async fn action_responses_arrive_in_request_order() {
	let mut ctx = common::TestCtx::new().await;
	let addr = ctx.serve().await;

	let actor = ctx
		.manager()
		.get_or_create_with_key("counter", &["ws-order".to_string()], json!({"init": 0}))
		.await
		.unwrap();

	let mut ws = connect(addr, &actor.actor_id, "/connect", "cleat.encoding.json").await;

	for id in 100..120u64 {
		let frame = encode_to_server(
			Encoding::Json,
			&ToServer::ActionRequest(ActionRequest {
				id,
				name: "increment".to_string(),
				args: Value::Null,
			}),
		);
		ws.send(frame).await.unwrap();
	}

	for (i, expected_id) in (100..120u64).enumerate() {
		let incoming = next_incoming(Encoding::Json, &mut ws).await;
		assert_eq!(
			incoming,
			Incoming::Response {
				id: expected_id,
				output: json!(i as i64 + 1),
			},
		);
	}

	ws.close(None).await.unwrap();
	ctx.close().await;
}

#[tokio::test]
async fn broadcast_reaches_every_encoding_once() {
	let mut ctx = common::TestCtx::new().await;
	let addr = ctx.serve().await;

	let actor = ctx
		.manager()
		.get_or_create_with_key("ticker", &["fanout".to_string()], json!(null))
		.await
		.unwrap();

	let encodings = [Encoding::Json, Encoding::Cbor, Encoding::Bare];
	let mut clients = Vec::new();
	for encoding in encodings {
		let protocols = format!("cleat.encoding.{encoding}");
		let mut ws = connect(addr, &actor.actor_id, "/connect", &protocols).await;

		ws.send(encode_to_server(
			encoding,
			&ToServer::SubscriptionRequest(SubscriptionRequest {
				event_name: "tick".to_string(),
				subscribe: true,
			}),
		))
		.await
		.unwrap();

		// Per-connection ordering: once this action answers, the
		// subscription before it has been applied.
		ws.send(encode_to_server(
			encoding,
			&ToServer::ActionRequest(ActionRequest {
				id: 1,
				name: "noop".to_string(),
				args: Value::Null,
			}),
		))
		.await
		.unwrap();
		let incoming = next_incoming(encoding, &mut ws).await;
		assert_eq!(
			incoming,
			Incoming::Response {
				id: 1,
				output: Value::Null,
			},
		);

		clients.push((encoding, ws));
	}

	ctx.http_action(&actor.actor_id, "tick", json!({"n": 1}))
		.await
		.unwrap();

	for (encoding, ws) in &mut clients {
		let incoming = next_incoming(*encoding, ws).await;
		assert_eq!(
			incoming,
			Incoming::Event {
				name: "tick".to_string(),
				args: vec![json!({"n": 1})],
			},
			"event for {encoding:?}"
		);
	}

	// Exactly one delivery per connection.
	for (_, ws) in &mut clients {
		ws.send(Message::Ping(Vec::new().into())).await.unwrap();
		let msg = tokio::time::timeout(Duration::from_millis(500), ws.next())
			.await
			.expect("pong expected")
			.expect("connection open")
			.expect("ws error");
		assert!(
			matches!(msg, Message::Pong(_)),
			"no extra event frames queued"
		);
	}

	ctx.close().await;
}

#[tokio::test]
async fn unsubscribed_connection_gets_nothing() {
	let mut ctx = common::TestCtx::new().await;
	let addr = ctx.serve().await;

	let actor = ctx
		.manager()
		.get_or_create_with_key("ticker", &["quiet".to_string()], json!(null))
		.await
		.unwrap();

	let mut ws = connect(addr, &actor.actor_id, "/connect", "cleat.encoding.json").await;

	// Subscribe, then unsubscribe again; the ack-less toggles are ordered
	// ahead of the noop action.
	for subscribe in [true, false] {
		ws.send(encode_to_server(
			Encoding::Json,
			&ToServer::SubscriptionRequest(SubscriptionRequest {
				event_name: "tick".to_string(),
				subscribe,
			}),
		))
		.await
		.unwrap();
	}
	ws.send(encode_to_server(
		Encoding::Json,
		&ToServer::ActionRequest(ActionRequest {
			id: 9,
			name: "noop".to_string(),
			args: Value::Null,
		}),
	))
	.await
	.unwrap();
	next_incoming(Encoding::Json, &mut ws).await;

	ctx.http_action(&actor.actor_id, "tick", json!({"n": 2}))
		.await
		.unwrap();

	ws.send(Message::Ping(Vec::new().into())).await.unwrap();
	let msg = tokio::time::timeout(Duration::from_millis(500), ws.next())
		.await
		.expect("pong expected")
		.expect("connection open")
		.expect("ws error");
	assert!(matches!(msg, Message::Pong(_)), "no event after unsubscribe");

	ws.close(None).await.unwrap();
	ctx.close().await;
}

#[tokio::test]
async fn malformed_frames_get_error_frames() {
	let mut ctx = common::TestCtx::new().await;
	let addr = ctx.serve().await;

	let actor = ctx
		.manager()
		.get_or_create_with_key("counter", &["malformed".to_string()], json!(null))
		.await
		.unwrap();

	let mut ws = connect(addr, &actor.actor_id, "/connect", "cleat.encoding.json").await;

	ws.send(Message::Text("not json at all".into())).await.unwrap();
	let incoming = next_incoming(Encoding::Json, &mut ws).await;
	let Incoming::Error {
		code_path,
		action_id,
	} = incoming
	else {
		panic!("expected error frame, got {incoming:?}");
	};
	assert_eq!(code_path, "message.malformed");
	assert_eq!(action_id, None);

	// Unknown action keeps the request id in the error.
	ws.send(encode_to_server(
		Encoding::Json,
		&ToServer::ActionRequest(ActionRequest {
			id: 42,
			name: "nope".to_string(),
			args: Value::Null,
		}),
	))
	.await
	.unwrap();
	let incoming = next_incoming(Encoding::Json, &mut ws).await;
	assert_eq!(
		incoming,
		Incoming::Error {
			code_path: "action.not_found".to_string(),
			action_id: Some(42),
		},
	);

	ws.close(None).await.unwrap();
	ctx.close().await;
}

#[tokio::test]
async fn inspector_requires_matching_token() {
	let mut ctx = common::TestCtx::new().await;
	let addr = ctx.serve().await;

	let actor = ctx
		.manager()
		.get_or_create_with_key("counter", &["inspected".to_string()], json!(null))
		.await
		.unwrap();

	// Correct token: a status document arrives.
	let mut ws = connect(
		addr,
		&actor.actor_id,
		"/inspector",
		"cleat.inspector.test-inspector-token",
	)
	.await;
	let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
		.await
		.expect("inspector reply expected")
		.expect("connection open")
		.expect("ws error");
	let Message::Text(text) = msg else {
		panic!("expected a text document");
	};
	let doc: Value = serde_json::from_str(&text).unwrap();
	assert_eq!(doc["actorId"], json!(actor.actor_id));
	assert_eq!(doc["lifecycle"], json!("awake"));

	// Wrong token: the session is rejected without a document.
	let mut ws = connect(
		addr,
		&actor.actor_id,
		"/inspector",
		"cleat.inspector.wrong-token",
	)
	.await;
	let msg = tokio::time::timeout(Duration::from_secs(5), ws.next()).await;
	match msg {
		Ok(Some(Ok(Message::Close(frame)))) => {
			let reason = frame.map(|frame| frame.reason.to_string()).unwrap_or_default();
			assert_eq!(reason, "auth.forbidden");
		}
		Ok(None) | Ok(Some(Err(_))) => {}
		other => panic!("expected rejection, got {other:?}"),
	}

	ctx.close().await;
}
