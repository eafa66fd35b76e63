use serde::{Deserialize, Serialize};

mod macros;

/// Structured error carried across the runtime and surfaced to clients.
///
/// `message` is always safe to show to a client. `internal_message`, when
/// present, carries operator detail and is only exposed when the runtime is
/// configured to expose internal errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleatError {
	pub group: String,
	pub code: String,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub internal_message: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub metadata: Option<serde_json::Value>,
	pub status: u16,
}

impl CleatError {
	pub fn new(
		group: impl Into<String>,
		code: impl Into<String>,
		message: impl Into<String>,
		status: u16,
	) -> Self {
		CleatError {
			group: group.into(),
			code: code.into(),
			message: message.into(),
			internal_message: None,
			metadata: None,
			status,
		}
	}

	pub fn with_internal_message(mut self, internal_message: impl Into<String>) -> Self {
		self.internal_message = Some(internal_message.into());
		self
	}

	pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
		self.metadata = Some(metadata);
		self
	}

	/// The fallback for errors that were not built from a defined error type.
	/// The original error stays out of `message` so internals never leak by
	/// default.
	pub fn internal() -> Self {
		CleatError::new("actor", "internal_error", "Internal error.", 500)
	}

	pub fn build(self) -> anyhow::Error {
		anyhow::Error::new(self)
	}

	/// Recovers the structured error from an `anyhow` chain. Anything without
	/// a `CleatError` in its chain collapses to [`CleatError::internal`] with
	/// the chain rendered into `internal_message`.
	pub fn extract(err: &anyhow::Error) -> CleatError {
		for cause in err.chain() {
			if let Some(found) = cause.downcast_ref::<CleatError>() {
				return found.clone();
			}
		}

		CleatError::internal().with_internal_message(format!("{err:#}"))
	}

	/// `"group.code"`, the form used in logs and the wire taxonomy.
	pub fn code_path(&self) -> String {
		format!("{}.{}", self.group, self.code)
	}
}

impl std::fmt::Display for CleatError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}.{}: ", self.group, self.code)?;
		match &self.internal_message {
			Some(internal_message) => write!(f, "{internal_message}"),
			None => write!(f, "{}", self.message),
		}
	}
}

impl std::error::Error for CleatError {}

/// Implemented by every enum declared through [`define_errors!`].
pub trait ErrorParts {
	fn group(&self) -> &'static str;
	fn code(&self) -> &'static str;
	fn status(&self) -> u16;
	fn message(&self) -> String;
	fn internal_message(&self) -> Option<String>;
	fn metadata(&self) -> Option<serde_json::Value> {
		None
	}

	fn to_error(&self) -> CleatError {
		let mut err = CleatError::new(self.group(), self.code(), self.message(), self.status());
		err.internal_message = self.internal_message();
		err.metadata = self.metadata();
		err
	}

	fn build(&self) -> anyhow::Error {
		self.to_error().build()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use anyhow::Context;

	crate::define_errors! {
		#[group("widget")]
		pub enum Widget {
			#[status(404)]
			#[error("not_found", "The widget does not exist.")]
			NotFound,

			#[error(
				"too_large",
				"Widget too large.",
				"Widget too large (max {max_size})."
			)]
			TooLarge { max_size: usize },
		}
	}

	#[test]
	fn extract_round_trips_through_anyhow() {
		let err = Widget::NotFound.build().context("loading widget");
		let extracted = CleatError::extract(&err);
		assert_eq!(extracted.group, "widget");
		assert_eq!(extracted.code, "not_found");
		assert_eq!(extracted.status, 404);
	}

	#[test]
	fn formatted_internal_message() {
		let err = Widget::TooLarge { max_size: 128 }.to_error();
		assert_eq!(err.message, "Widget too large.");
		assert_eq!(
			err.internal_message.as_deref(),
			Some("Widget too large (max 128).")
		);
		assert_eq!(err.status, 400);
	}

	#[test]
	fn unknown_errors_collapse_to_internal() {
		let err = anyhow::anyhow!("db on fire");
		let extracted = CleatError::extract(&err);
		assert_eq!(extracted.code_path(), "actor.internal_error");
		assert_eq!(extracted.message, "Internal error.");
		assert!(extracted.internal_message.unwrap().contains("db on fire"));
	}
}
