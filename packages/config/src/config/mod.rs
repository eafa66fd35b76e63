use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod gateway;
mod runtime;
mod storage;

pub use gateway::*;
pub use runtime::*;
pub use storage::*;

/// Root configuration for a cleat process.
#[derive(Debug, Clone, Serialize, Deserialize, Default, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub runtime: Runtime,
	#[serde(default)]
	pub gateway: Gateway,
	#[serde(default)]
	pub storage: Storage,
}

impl Config {
	pub fn with_storage_root(root: impl Into<PathBuf>) -> Self {
		Config {
			storage: Storage {
				root: Some(root.into()),
				..Default::default()
			},
			..Default::default()
		}
	}
}
