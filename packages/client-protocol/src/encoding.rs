use anyhow::{Context, Result, bail};
use serde_bytes::ByteBuf;
use serde_json::Value;
use vbare::OwnedVersionedData;

use crate::{PROTOCOL_VERSION, ToClient, ToServer, v2, versioned};

/// Wire format negotiated per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
	Json,
	Cbor,
	Bare,
}

impl Encoding {
	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"json" => Some(Encoding::Json),
			"cbor" => Some(Encoding::Cbor),
			"bare" => Some(Encoding::Bare),
			_ => None,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Encoding::Json => "json",
			Encoding::Cbor => "cbor",
			Encoding::Bare => "bare",
		}
	}

	/// Whether frames for this encoding travel as binary WebSocket messages.
	pub fn is_binary(&self) -> bool {
		!matches!(self, Encoding::Json)
	}
}

impl std::fmt::Display for Encoding {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A frame ready to put on the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingFrame {
	Text(String),
	Binary(Vec<u8>),
}

impl OutgoingFrame {
	pub fn len(&self) -> usize {
		match self {
			OutgoingFrame::Text(s) => s.len(),
			OutgoingFrame::Binary(b) => b.len(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Encodes an opaque value as a standalone CBOR document.
pub fn cbor_encode(value: &Value) -> Result<Vec<u8>> {
	let mut buf = Vec::new();
	ciborium::ser::into_writer(value, &mut buf).context("failed to encode cbor payload")?;
	Ok(buf)
}

/// Decodes a standalone CBOR document into a JSON-compatible value.
pub fn cbor_decode(buf: &[u8]) -> Result<Value> {
	ciborium::de::from_reader(buf).context("failed to decode cbor payload")
}

pub fn decode_to_server(encoding: Encoding, buf: &[u8]) -> Result<ToServer> {
	match encoding {
		Encoding::Json => {
			let text = std::str::from_utf8(buf).context("frame is not valid utf-8")?;
			serde_json::from_str(text).context("invalid json frame")
		}
		Encoding::Cbor => ciborium::de::from_reader(buf).context("invalid cbor frame"),
		Encoding::Bare => {
			let wire = versioned::ToServer::deserialize_with_embedded_version(buf)
				.context("invalid bare frame")?;
			to_server_from_wire(wire)
		}
	}
}

pub fn encode_to_client(encoding: Encoding, msg: ToClient) -> Result<OutgoingFrame> {
	match encoding {
		Encoding::Json => {
			let text = serde_json::to_string(&msg).context("failed to encode json frame")?;
			Ok(OutgoingFrame::Text(text))
		}
		Encoding::Cbor => {
			let mut buf = Vec::new();
			ciborium::ser::into_writer(&msg, &mut buf).context("failed to encode cbor frame")?;
			Ok(OutgoingFrame::Binary(buf))
		}
		Encoding::Bare => {
			let buf = versioned::ToClient::wrap_latest(to_client_to_wire(msg)?)
				.serialize_with_embedded_version(PROTOCOL_VERSION)
				.context("failed to encode bare frame")?;
			Ok(OutgoingFrame::Binary(buf))
		}
	}
}

fn to_server_from_wire(wire: v2::ToServer) -> Result<ToServer> {
	match wire {
		v2::ToServer::ActionRequest(req) => Ok(ToServer::ActionRequest(crate::ActionRequest {
			id: req.id,
			name: req.name,
			args: cbor_decode(&req.args)?,
		})),
		v2::ToServer::SubscriptionRequest(req) => {
			Ok(ToServer::SubscriptionRequest(crate::SubscriptionRequest {
				event_name: req.event_name,
				subscribe: req.subscribe,
			}))
		}
	}
}

fn to_client_to_wire(msg: ToClient) -> Result<v2::ToClient> {
	match msg {
		ToClient::ActionResponse(resp) => Ok(v2::ToClient::ActionResponse(v2::ActionResponse {
			id: resp.id,
			output: ByteBuf::from(cbor_encode(&resp.output)?),
		})),
		ToClient::Error(err) => Ok(v2::ToClient::Error(v2::Error {
			group: err.group,
			code: err.code,
			message: err.message,
			metadata: err
				.metadata
				.as_ref()
				.map(cbor_encode)
				.transpose()?
				.map(ByteBuf::from),
			action_id: err.action_id,
		})),
		ToClient::Event(event) => {
			let args = Value::Array(event.args);
			Ok(v2::ToClient::Event(v2::Event {
				name: event.name,
				args: ByteBuf::from(cbor_encode(&args)?),
			}))
		}
	}
}

/// Decodes an event payload from a wire frame back into its argument list.
pub fn event_args_from_wire(args: &[u8]) -> Result<Vec<Value>> {
	match cbor_decode(args)? {
		Value::Array(args) => Ok(args),
		_ => bail!("event args must be an array"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn json_action_request_decodes() {
		let frame = r#"{"tag":"ActionRequest","val":{"id":7,"name":"increment","args":{"by":2}}}"#;
		let msg = decode_to_server(Encoding::Json, frame.as_bytes()).unwrap();
		let ToServer::ActionRequest(req) = msg else {
			panic!("expected action request");
		};
		assert_eq!(req.id, 7);
		assert_eq!(req.name, "increment");
		assert_eq!(req.args, json!({"by": 2}));
	}

	#[test]
	fn json_rejects_unknown_fields() {
		let frame = r#"{"tag":"ActionRequest","val":{"id":7,"name":"x","args":null,"bogus":1}}"#;
		assert!(decode_to_server(Encoding::Json, frame.as_bytes()).is_err());
	}

	#[test]
	fn bare_round_trip_preserves_action_id() {
		let msg = ToClient::ActionResponse(crate::ActionResponse {
			id: u64::MAX - 3,
			output: json!([1, "two", {"three": 3}]),
		});
		let frame = encode_to_client(Encoding::Bare, msg).unwrap();
		let OutgoingFrame::Binary(buf) = frame else {
			panic!("bare frames are binary");
		};

		// First two bytes are the little-endian protocol version.
		assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), PROTOCOL_VERSION);

		let wire = versioned::ToClient::deserialize_with_embedded_version(&buf).unwrap();
		let v2::ToClient::ActionResponse(resp) = wire else {
			panic!("expected action response");
		};
		assert_eq!(resp.id, u64::MAX - 3);
		assert_eq!(
			cbor_decode(&resp.output).unwrap(),
			json!([1, "two", {"three": 3}])
		);
	}

	#[test]
	fn cbor_round_trip() {
		let frame = encode_to_client(
			Encoding::Cbor,
			ToClient::Event(crate::EventMessage {
				name: "tick".into(),
				args: vec![json!({"n": 1})],
			}),
		)
		.unwrap();
		let OutgoingFrame::Binary(buf) = frame else {
			panic!("cbor frames are binary");
		};

		let decoded: ToClient = ciborium::de::from_reader(buf.as_slice()).unwrap();
		let ToClient::Event(event) = decoded else {
			panic!("expected event");
		};
		assert_eq!(event.name, "tick");
		assert_eq!(event.args, vec![json!({"n": 1})]);
	}

	#[test]
	fn bare_subscription_request_decodes() {
		let wire = versioned::ToServer::wrap_latest(v2::ToServer::SubscriptionRequest(
			v2::SubscriptionRequest {
				event_name: "tick".into(),
				subscribe: true,
			},
		))
		.serialize_with_embedded_version(PROTOCOL_VERSION)
		.unwrap();

		let msg = decode_to_server(Encoding::Bare, &wire).unwrap();
		let ToServer::SubscriptionRequest(req) = msg else {
			panic!("expected subscription request");
		};
		assert_eq!(req.event_name, "tick");
		assert!(req.subscribe);
	}
}
