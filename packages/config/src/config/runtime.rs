use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Runtime {
	/// Time (in milliseconds) an actor stays awake with no connections,
	/// pending operations, or keep-awake holds before it puts itself to
	/// sleep. Defaults to 30 seconds.
	sleep_timeout: Option<u64>,
	/// Whether actors are exempt from the inactivity sleep timer.
	no_sleep: Option<bool>,
	/// Default timeout (in milliseconds) for a single action invocation.
	/// Defaults to 60 seconds.
	action_timeout: Option<u64>,
	/// Timeout (in milliseconds) for each lifecycle hook invocation.
	/// Defaults to the action timeout.
	hook_timeout: Option<u64>,
	/// Time (in milliseconds) the `run` handler gets to unwind cooperatively
	/// on shutdown before it is abandoned. Defaults to 5 seconds.
	run_stop_timeout: Option<u64>,
	/// Time (in milliseconds) `wait_until`-tracked tasks get to drain on
	/// shutdown. Defaults to 10 seconds.
	wait_until_timeout: Option<u64>,
	/// Surface internal error messages to clients. Development only.
	expose_internal_errors: Option<bool>,
}

impl Runtime {
	pub fn sleep_timeout(&self) -> Duration {
		Duration::from_millis(self.sleep_timeout.unwrap_or(30_000))
	}

	pub fn no_sleep(&self) -> bool {
		self.no_sleep.unwrap_or_default()
	}

	pub fn action_timeout(&self) -> Duration {
		Duration::from_millis(self.action_timeout.unwrap_or(60_000))
	}

	pub fn hook_timeout(&self) -> Duration {
		self.hook_timeout
			.map(Duration::from_millis)
			.unwrap_or_else(|| self.action_timeout())
	}

	pub fn run_stop_timeout(&self) -> Duration {
		Duration::from_millis(self.run_stop_timeout.unwrap_or(5_000))
	}

	pub fn wait_until_timeout(&self) -> Duration {
		Duration::from_millis(self.wait_until_timeout.unwrap_or(10_000))
	}

	pub fn expose_internal_errors(&self) -> bool {
		self.expose_internal_errors.unwrap_or_default()
	}

	pub fn set_sleep_timeout(&mut self, timeout: Duration) {
		self.sleep_timeout = Some(timeout.as_millis() as u64);
	}

	pub fn set_action_timeout(&mut self, timeout: Duration) {
		self.action_timeout = Some(timeout.as_millis() as u64);
	}

	pub fn set_no_sleep(&mut self, no_sleep: bool) {
		self.no_sleep = Some(no_sleep);
	}
}
