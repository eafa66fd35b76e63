mod gateway;
mod runtime;
mod telemetry;
mod term_signal;

pub use cleat_config::{Config, Gateway, Runtime as RuntimeConfig, Storage};
pub use cleat_core::{
	ActorContext, ActorDefinition, ActorDefinitionBuilder, ActorOptions, ActorOutput, ConnHandle,
	HibernationKey, InvokeTarget, Manager, OpMode,
};
pub use cleat_error::CleatError;
pub use runtime::Runtime;
pub use telemetry::init_tracing;
pub use term_signal::wait_for_term;

pub use serde_json::Value;
