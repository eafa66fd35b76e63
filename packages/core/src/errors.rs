cleat_error::define_errors! {
	#[group("action")]
	pub enum Action {
		#[status(408)]
		#[error("timed_out", "The action did not complete in time.")]
		TimedOut,

		#[status(404)]
		#[error(
			"not_found",
			"The requested action does not exist.",
			"Action '{name}' is not defined on this actor."
		)]
		NotFound { name: String },

		#[error(
			"invalid_request",
			"The action request is invalid.",
			"Invalid action request: {reason}"
		)]
		InvalidRequest { reason: String },
	}

	#[group("actor")]
	pub enum Actor {
		#[status(404)]
		#[error("not_found", "The actor does not exist.")]
		NotFound,

		#[status(409)]
		#[error(
			"duplicate_key",
			"Actor key already in use.",
			"Actor key already in use by actor '{existing_actor_id}'."
		)]
		DuplicateKey { existing_actor_id: String },

		#[status(409)]
		#[error("stopping", "The actor is stopping.")]
		Stopping,

		#[status(409)]
		#[error("aborted", "The actor aborted while the operation was pending.")]
		Aborted,
	}

	#[group("queue")]
	pub enum Queue {
		#[status(429)]
		#[error(
			"full",
			"The actor's operation queue is full.",
			"Operation queue is full (max {max} waiters)."
		)]
		Full { max: usize },
	}

	#[group("encoding")]
	pub enum EncodingError {
		#[error(
			"invalid",
			"Unsupported encoding.",
			"Unsupported encoding: {requested}"
		)]
		Invalid { requested: String },
	}

	#[group("message")]
	pub enum Message {
		#[error(
			"malformed",
			"The message could not be decoded.",
			"Malformed message: {reason}"
		)]
		Malformed { reason: String },

		#[status(413)]
		#[error(
			"incoming_too_long",
			"Incoming message exceeds the size limit.",
			"Incoming message of {size} bytes exceeds the limit of {max} bytes."
		)]
		IncomingTooLong { size: usize, max: usize },

		#[status(413)]
		#[error(
			"outgoing_too_long",
			"Outgoing message exceeds the size limit.",
			"Outgoing message of {size} bytes exceeds the limit of {max} bytes."
		)]
		OutgoingTooLong { size: usize, max: usize },
	}

	#[group("state")]
	pub enum State {
		#[error("invalid_type", "Actor state must be serializable.")]
		InvalidType,
	}

	#[group("auth")]
	pub enum Auth {
		#[status(403)]
		#[error("forbidden", "Forbidden.")]
		Forbidden,
	}
}
