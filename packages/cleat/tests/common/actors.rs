use std::time::Duration;

use anyhow::{Context, Result};
use cleat::{ActorContext, ActorDefinition, ActorOptions, OpMode, Value};
use serde_json::json;

pub const COUNTER_KEY: &[u8] = b"v";

/// All actor definitions registered by the test runtime.
pub fn definitions() -> Vec<ActorDefinition> {
	vec![counter(), ticker(), alarmer(), sleeper()]
}

async fn kv_json_get(ctx: &ActorContext, key: &[u8]) -> Result<Option<Value>> {
	let slots = ctx.kv_get(vec![key.to_vec()]).await?;
	slots
		.into_iter()
		.next()
		.flatten()
		.map(|bytes| serde_json::from_slice(&bytes).context("kv value is not json"))
		.transpose()
}

async fn kv_json_put(ctx: &ActorContext, key: &[u8], value: &Value) -> Result<()> {
	let bytes = serde_json::to_vec(value).context("serialize kv value")?;
	ctx.kv_put(vec![(key.to_vec(), bytes)]).await
}

/// A persistent counter. `input.init` seeds the stored value.
fn counter() -> ActorDefinition {
	ActorDefinition::builder("counter")
		.initial_kv(|input| {
			let init = input.get("init").cloned().unwrap_or(json!(0));
			Ok(vec![(COUNTER_KEY.to_vec(), serde_json::to_vec(&init)?)])
		})
		.action("increment", |ctx, _args| async move {
			let current = kv_json_get(&ctx, COUNTER_KEY)
				.await?
				.and_then(|value| value.as_i64())
				.unwrap_or(0);
			// Yield between read and write so broken exclusion loses updates.
			tokio::time::sleep(Duration::from_millis(1)).await;
			let next = json!(current + 1);
			kv_json_put(&ctx, COUNTER_KEY, &next).await?;
			Ok(next)
		})
		.action_with("get", OpMode::Readonly, None, |ctx, _args| async move {
			Ok(kv_json_get(&ctx, COUNTER_KEY).await?.unwrap_or(Value::Null))
		})
		.build()
}

/// Broadcasts `tick` events to subscribers.
fn ticker() -> ActorDefinition {
	ActorDefinition::builder("ticker")
		.action("tick", |ctx, args| async move {
			ctx.broadcast("tick", vec![args]).await?;
			Ok(json!("ticked"))
		})
		.action_with("noop", OpMode::Readonly, None, |_ctx, _args| async move {
			Ok(Value::Null)
		})
		.build()
}

/// Schedules alarms and records each firing.
fn alarmer() -> ActorDefinition {
	ActorDefinition::builder("alarmer")
		.action("arm", |ctx, args| async move {
			let delay_ms = args
				.get("delayMs")
				.and_then(|value| value.as_i64())
				.context("delayMs required")?;
			let ts = cleat_util::timestamp::now() + delay_ms;
			ctx.set_alarm(ts).await?;
			Ok(json!(ts))
		})
		.on_alarm(|ctx| async move {
			let fires = kv_json_get(&ctx, b"fires")
				.await?
				.and_then(|value| value.as_i64())
				.unwrap_or(0);
			kv_json_put(&ctx, b"fires", &json!(fires + 1)).await?;
			kv_json_put(&ctx, b"last_fire_ts", &json!(cleat_util::timestamp::now())).await?;
			Ok(())
		})
		.build()
}

/// Goes to sleep quickly so inactivity behavior is testable.
fn sleeper() -> ActorDefinition {
	ActorDefinition::builder("sleeper")
		.options(ActorOptions {
			sleep_timeout: Some(Duration::from_millis(200)),
			..Default::default()
		})
		.action_with("linger", OpMode::Readonly, None, |_ctx, args| async move {
			let hold_ms = args
				.get("holdMs")
				.and_then(|value| value.as_u64())
				.unwrap_or(50);
			tokio::time::sleep(Duration::from_millis(hold_ms)).await;
			Ok(json!("lingered"))
		})
		.action_with("probe", OpMode::Readonly, None, |_ctx, _args| async move {
			Ok(json!("alive"))
		})
		.build()
}
