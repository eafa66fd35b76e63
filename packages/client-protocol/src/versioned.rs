use anyhow::{Ok, Result, bail};
use vbare::OwnedVersionedData;

use crate::{v1, v2};

pub enum ToServer {
	V1(v1::ToServer),
	V2(v2::ToServer),
}

impl OwnedVersionedData for ToServer {
	type Latest = v2::ToServer;

	fn wrap_latest(latest: v2::ToServer) -> Self {
		ToServer::V2(latest)
	}

	fn unwrap_latest(self) -> Result<Self::Latest> {
		if let ToServer::V2(data) = self {
			Ok(data)
		} else {
			bail!("version not latest");
		}
	}

	fn deserialize_version(payload: &[u8], version: u16) -> Result<Self> {
		match version {
			1 => Ok(ToServer::V1(serde_bare::from_slice(payload)?)),
			2 => Ok(ToServer::V2(serde_bare::from_slice(payload)?)),
			_ => bail!("invalid version: {version}"),
		}
	}

	fn serialize_version(self, _version: u16) -> Result<Vec<u8>> {
		match self {
			ToServer::V1(data) => serde_bare::to_vec(&data).map_err(Into::into),
			ToServer::V2(data) => serde_bare::to_vec(&data).map_err(Into::into),
		}
	}

	fn deserialize_converters() -> Vec<impl Fn(Self) -> Result<Self>> {
		vec![Self::v1_to_v2]
	}

	fn serialize_converters() -> Vec<impl Fn(Self) -> Result<Self>> {
		vec![Self::v2_to_v1]
	}
}

impl ToServer {
	fn v1_to_v2(self) -> Result<Self> {
		if let ToServer::V1(x) = self {
			let inner = match x {
				v1::ToServer::ActionRequest(req) => v2::ToServer::ActionRequest(v2::ActionRequest {
					id: req.id,
					name: req.name,
					args: req.args,
				}),
				v1::ToServer::SubscriptionRequest(req) => {
					v2::ToServer::SubscriptionRequest(v2::SubscriptionRequest {
						event_name: req.event_name,
						subscribe: req.subscribe,
					})
				}
			};

			Ok(ToServer::V2(inner))
		} else {
			bail!("unexpected version");
		}
	}

	fn v2_to_v1(self) -> Result<Self> {
		if let ToServer::V2(x) = self {
			let inner = match x {
				v2::ToServer::ActionRequest(req) => v1::ToServer::ActionRequest(v1::ActionRequest {
					id: req.id,
					name: req.name,
					args: req.args,
				}),
				v2::ToServer::SubscriptionRequest(req) => {
					v1::ToServer::SubscriptionRequest(v1::SubscriptionRequest {
						event_name: req.event_name,
						subscribe: req.subscribe,
					})
				}
			};

			Ok(ToServer::V1(inner))
		} else {
			bail!("unexpected version");
		}
	}
}

pub enum ToClient {
	V1(v1::ToClient),
	V2(v2::ToClient),
}

impl OwnedVersionedData for ToClient {
	type Latest = v2::ToClient;

	fn wrap_latest(latest: v2::ToClient) -> Self {
		ToClient::V2(latest)
	}

	fn unwrap_latest(self) -> Result<Self::Latest> {
		if let ToClient::V2(data) = self {
			Ok(data)
		} else {
			bail!("version not latest");
		}
	}

	fn deserialize_version(payload: &[u8], version: u16) -> Result<Self> {
		match version {
			1 => Ok(ToClient::V1(serde_bare::from_slice(payload)?)),
			2 => Ok(ToClient::V2(serde_bare::from_slice(payload)?)),
			_ => bail!("invalid version: {version}"),
		}
	}

	fn serialize_version(self, _version: u16) -> Result<Vec<u8>> {
		match self {
			ToClient::V1(data) => serde_bare::to_vec(&data).map_err(Into::into),
			ToClient::V2(data) => serde_bare::to_vec(&data).map_err(Into::into),
		}
	}

	fn deserialize_converters() -> Vec<impl Fn(Self) -> Result<Self>> {
		vec![Self::v1_to_v2]
	}

	fn serialize_converters() -> Vec<impl Fn(Self) -> Result<Self>> {
		vec![Self::v2_to_v1]
	}
}

impl ToClient {
	fn v1_to_v2(self) -> Result<Self> {
		if let ToClient::V1(x) = self {
			let inner = match x {
				v1::ToClient::ActionResponse(resp) => {
					v2::ToClient::ActionResponse(v2::ActionResponse {
						id: resp.id,
						output: resp.output,
					})
				}
				v1::ToClient::Error(err) => v2::ToClient::Error(v2::Error {
					group: err.group,
					code: err.code,
					message: err.message,
					// Unknown in v1
					metadata: None,
					action_id: err.action_id,
				}),
				v1::ToClient::Event(event) => v2::ToClient::Event(v2::Event {
					name: event.name,
					args: event.args,
				}),
			};

			Ok(ToClient::V2(inner))
		} else {
			bail!("unexpected version");
		}
	}

	fn v2_to_v1(self) -> Result<Self> {
		if let ToClient::V2(x) = self {
			let inner = match x {
				v2::ToClient::ActionResponse(resp) => {
					v1::ToClient::ActionResponse(v1::ActionResponse {
						id: resp.id,
						output: resp.output,
					})
				}
				v2::ToClient::Error(err) => v1::ToClient::Error(v1::Error {
					group: err.group,
					code: err.code,
					message: err.message,
					action_id: err.action_id,
				}),
				v2::ToClient::Event(event) => v1::ToClient::Event(v1::Event {
					name: event.name,
					args: event.args,
				}),
			};

			Ok(ToClient::V1(inner))
		} else {
			bail!("unexpected version");
		}
	}
}
