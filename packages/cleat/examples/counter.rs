//! Minimal runnable actor: a persistent counter served over the gateway.
//!
//! ```sh
//! cargo run -p cleat --example counter
//! curl -X POST "http://127.0.0.1:6520/actors/$ID/action/increment" -d null
//! ```

use anyhow::Result;
use cleat::{ActorDefinition, Config, Runtime, Value};
use serde_json::json;

const KEY: &[u8] = b"count";

fn counter() -> ActorDefinition {
	ActorDefinition::builder("counter")
		.action("increment", |ctx, _args| async move {
			let slots = ctx.kv_get(vec![KEY.to_vec()]).await?;
			let current: i64 = slots
				.into_iter()
				.next()
				.flatten()
				.map(|bytes| serde_json::from_slice(&bytes))
				.transpose()?
				.unwrap_or(0);

			let next = current + 1;
			ctx.kv_put(vec![(KEY.to_vec(), serde_json::to_vec(&next)?)])
				.await?;
			Ok(json!(next))
		})
		.action("get", |ctx, _args| async move {
			let slots = ctx.kv_get(vec![KEY.to_vec()]).await?;
			let value = slots
				.into_iter()
				.next()
				.flatten()
				.map(|bytes| serde_json::from_slice::<Value>(&bytes))
				.transpose()?
				.unwrap_or(json!(0));
			Ok(value)
		})
		.build()
}

#[tokio::main]
async fn main() -> Result<()> {
	cleat::init_tracing();

	let config = Config::with_storage_root("./data");
	let mut runtime = Runtime::new(config, vec![counter()]).await?;

	let addr = runtime.serve().await?;
	let actor = runtime
		.manager()
		.get_or_create_with_key("counter", &["demo".to_string()], Value::Null)
		.await?;
	tracing::info!(%addr, actor_id = %actor.actor_id, "counter ready");

	cleat::wait_for_term().await?;
	runtime.close().await
}
