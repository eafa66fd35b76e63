use anyhow::{Context, Result};
use cleat_client_protocol::encoding::Encoding;
use percent_encoding::percent_decode_str;
use subtle::ConstantTimeEq;

/// `Sec-WebSocket-Protocol` entries understood by the gateway.
pub const ENCODING_PREFIX: &str = "cleat.encoding.";
pub const CONN_PARAMS_PREFIX: &str = "cleat.params.";
pub const INSPECTOR_TOKEN_PREFIX: &str = "cleat.inspector.";

/// Everything a client can negotiate at upgrade time.
#[derive(Debug, Clone, Default)]
pub struct NegotiatedProtocols {
	pub encoding: Option<Encoding>,
	pub conn_params: Option<serde_json::Value>,
	pub inspector_token: Option<String>,
	/// The protocol entry echoed back in the upgrade response, when any
	/// recognized entry was present.
	pub selected: Option<String>,
}

/// Parses a `Sec-WebSocket-Protocol` header value. Unknown entries are
/// ignored; within each category the first entry wins.
pub fn parse_protocols(header: &str) -> Result<NegotiatedProtocols> {
	let mut negotiated = NegotiatedProtocols::default();

	for entry in header.split(',') {
		let entry = entry.trim();

		if let Some(rest) = entry.strip_prefix(ENCODING_PREFIX) {
			if negotiated.encoding.is_none() {
				negotiated.encoding = Encoding::parse(rest);
				if negotiated.encoding.is_some() {
					negotiated.selected = Some(entry.to_string());
				}
			}
		} else if let Some(rest) = entry.strip_prefix(CONN_PARAMS_PREFIX) {
			if negotiated.conn_params.is_none() {
				let decoded = percent_decode_str(rest)
					.decode_utf8()
					.context("connection params are not valid utf-8")?;
				negotiated.conn_params = Some(
					serde_json::from_str(&decoded).context("connection params are not valid json")?,
				);
			}
		} else if let Some(rest) = entry.strip_prefix(INSPECTOR_TOKEN_PREFIX) {
			if negotiated.inspector_token.is_none() {
				negotiated.inspector_token = Some(rest.to_string());
			}
		}
	}

	Ok(negotiated)
}

/// Constant-time token comparison for inspector routes.
pub fn token_matches(expected: &str, provided: &str) -> bool {
	expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_mixed_entries() {
		let header = "cleat.encoding.cbor, cleat.params.%7B%22room%22%3A%22a%22%7D, x-unknown";
		let negotiated = parse_protocols(header).unwrap();
		assert_eq!(negotiated.encoding, Some(Encoding::Cbor));
		assert_eq!(
			negotiated.conn_params,
			Some(serde_json::json!({"room": "a"}))
		);
		assert_eq!(negotiated.selected.as_deref(), Some("cleat.encoding.cbor"));
		assert!(negotiated.inspector_token.is_none());
	}

	#[test]
	fn first_encoding_wins() {
		let negotiated = parse_protocols("cleat.encoding.json,cleat.encoding.bare").unwrap();
		assert_eq!(negotiated.encoding, Some(Encoding::Json));
	}

	#[test]
	fn invalid_params_are_an_error() {
		assert!(parse_protocols("cleat.params.not-json").is_err());
	}

	#[test]
	fn token_compare() {
		assert!(token_matches("secret", "secret"));
		assert!(!token_matches("secret", "secres"));
		assert!(!token_matches("secret", "longer-token"));
	}
}
