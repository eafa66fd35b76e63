use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToServer {
	ActionRequest(ActionRequest),
	SubscriptionRequest(SubscriptionRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
	pub id: u64,
	pub name: String,
	pub args: ByteBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
	pub event_name: String,
	pub subscribe: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToClient {
	ActionResponse(ActionResponse),
	Error(Error),
	Event(Event),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
	pub id: u64,
	pub output: ByteBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
	pub group: String,
	pub code: String,
	pub message: String,
	pub action_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
	pub name: String,
	pub args: ByteBuf,
}
