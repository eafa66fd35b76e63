mod common;

use std::time::Duration;

use serde_json::json;

/// Three alarms are requested; only the earliest may fire, exactly once, and
/// the alarm file must be gone afterwards.
#[tokio::test]
async fn earliest_alarm_wins_and_fires_once() {
	let ctx = common::TestCtx::new().await;

	let actor = ctx
		.manager()
		.get_or_create_with_key("alarmer", &["earliest".to_string()], json!(null))
		.await
		.unwrap();

	let requested_at = cleat_util::timestamp::now();
	for delay_ms in [1_000, 500, 2_000] {
		ctx.http_action(&actor.actor_id, "arm", json!({"delayMs": delay_ms}))
			.await
			.unwrap();
	}

	// Well past the earliest deadline, well before the later ones.
	tokio::time::sleep(Duration::from_millis(900)).await;

	let (fires, fired_at) = read_fires(&ctx, &actor.actor_id).await;
	assert_eq!(fires, 1, "exactly one firing");
	let elapsed = fired_at.expect("fire timestamp recorded") - requested_at;
	assert!(
		(400..900).contains(&elapsed),
		"fired at +{elapsed}ms, expected ~500ms"
	);

	// The fired alarm's file is deleted.
	assert!(
		ctx.runtime
			.registry()
			.store()
			.load_alarm(&actor.actor_id)
			.await
			.unwrap()
			.is_none()
	);

	// No second firing later.
	tokio::time::sleep(Duration::from_millis(1_400)).await;
	let (fires, _) = read_fires(&ctx, &actor.actor_id).await;
	assert_eq!(fires, 1, "later alarms were superseded");

	ctx.close().await;
}

#[tokio::test]
async fn alarm_survives_restart() {
	let ctx = common::TestCtx::new().await;

	let actor = ctx
		.manager()
		.get_or_create_with_key("alarmer", &["recovered".to_string()], json!(null))
		.await
		.unwrap();

	ctx.http_action(&actor.actor_id, "arm", json!({"delayMs": 600}))
		.await
		.unwrap();

	// Restart before the deadline: the alarm file must be replayed.
	let ctx = ctx.restart().await;
	tokio::time::sleep(Duration::from_millis(900)).await;

	let (fires, _) = read_fires(&ctx, &actor.actor_id).await;
	assert_eq!(fires, 1, "alarm recovered and fired after restart");

	ctx.close().await;
}

/// Reads the firing counter and timestamp the alarmer writes from its hook.
async fn read_fires(test_ctx: &common::TestCtx, actor_id: &str) -> (i64, Option<i64>) {
	let instance = test_ctx
		.runtime
		.registry()
		.start_actor(actor_id)
		.await
		.expect("start actor");

	let ctx = instance.context();
	let slots = ctx
		.kv_get(vec![b"fires".to_vec(), b"last_fire_ts".to_vec()])
		.await
		.expect("kv read");

	let fires = slots[0]
		.as_deref()
		.map(|bytes| serde_json::from_slice::<i64>(bytes).expect("fires is a number"))
		.unwrap_or(0);
	let last = slots[1]
		.as_deref()
		.map(|bytes| serde_json::from_slice::<i64>(bytes).expect("ts is a number"));

	(fires, last)
}
