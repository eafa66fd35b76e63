use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Gateway {
	/// Host the gateway binds to. Defaults to 127.0.0.1.
	pub host: Option<String>,
	/// Port the gateway binds to. Defaults to 6520.
	pub port: Option<u16>,
	/// Maximum size (in bytes) of a single incoming client frame.
	/// Defaults to 1 MiB.
	max_incoming_message_size: Option<usize>,
	/// Maximum size (in bytes) of a single outgoing client frame.
	/// Defaults to 4 MiB.
	max_outgoing_message_size: Option<usize>,
	/// Interval (in milliseconds) between liveness pings on a client
	/// connection. Defaults to 5 seconds.
	connection_liveness_interval: Option<u64>,
	/// Time (in milliseconds) to wait for a pong before disconnecting.
	/// Defaults to 2.5 seconds.
	connection_liveness_timeout: Option<u64>,
	/// Token required on inspector routes. Inspector routes are rejected
	/// when unset.
	pub inspector_token: Option<String>,
}

impl Gateway {
	pub fn host(&self) -> &str {
		self.host.as_deref().unwrap_or("127.0.0.1")
	}

	pub fn port(&self) -> u16 {
		self.port.unwrap_or(6520)
	}

	pub fn max_incoming_message_size(&self) -> usize {
		self.max_incoming_message_size.unwrap_or(1024 * 1024)
	}

	pub fn max_outgoing_message_size(&self) -> usize {
		self.max_outgoing_message_size.unwrap_or(4 * 1024 * 1024)
	}

	pub fn connection_liveness_interval(&self) -> Duration {
		Duration::from_millis(self.connection_liveness_interval.unwrap_or(5_000))
	}

	pub fn connection_liveness_timeout(&self) -> Duration {
		Duration::from_millis(self.connection_liveness_timeout.unwrap_or(2_500))
	}
}
