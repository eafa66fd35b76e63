use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages received from a client. Exactly one frame per message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "tag", content = "val")]
pub enum ToServer {
	ActionRequest(ActionRequest),
	SubscriptionRequest(SubscriptionRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ActionRequest {
	pub id: u64,
	pub name: String,
	pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SubscriptionRequest {
	pub event_name: String,
	pub subscribe: bool,
}

/// Messages sent to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "tag", content = "val")]
pub enum ToClient {
	ActionResponse(ActionResponse),
	Error(ErrorBody),
	Event(EventMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
	/// Echoes the request id unchanged.
	pub id: u64,
	pub output: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
	pub group: String,
	pub code: String,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub metadata: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub action_id: Option<u64>,
}

/// Application event published to subscribed connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
	pub name: String,
	pub args: Vec<Value>,
}
