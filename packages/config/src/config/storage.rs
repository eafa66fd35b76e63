use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Storage {
	/// Root directory for actor state, databases, and alarms.
	/// Defaults to `./data`.
	pub root: Option<PathBuf>,
}

impl Storage {
	pub fn root(&self) -> &Path {
		self.root.as_deref().unwrap_or_else(|| Path::new("./data"))
	}

	pub fn state_dir(&self) -> PathBuf {
		self.root().join("state")
	}

	pub fn databases_dir(&self) -> PathBuf {
		self.root().join("databases")
	}

	pub fn alarms_dir(&self) -> PathBuf {
		self.root().join("alarms")
	}
}
