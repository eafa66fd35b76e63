mod common;

use std::time::Duration;

use serde_json::json;

/// The sleeper definition uses a 200 ms inactivity timeout.
const SLEEP_TIMEOUT: Duration = Duration::from_millis(200);

#[tokio::test]
async fn idle_actor_sleeps_and_wakes_cold() {
	let ctx = common::TestCtx::new().await;

	let actor = ctx
		.manager()
		.get_or_create_with_key("sleeper", &["idle".to_string()], json!(null))
		.await
		.unwrap();
	assert!(actor.sleep_ts.is_none());

	// Quiet well past the timeout: the entry disappears from the registry
	// and the persisted record carries sleep_ts.
	tokio::time::sleep(SLEEP_TIMEOUT * 4).await;
	assert!(ctx.runtime.registry().get_entry(&actor.actor_id).is_none());

	let slept = ctx.manager().get_with_key("sleeper", &["idle".to_string()]).await.unwrap();
	assert_eq!(slept.actor_id, actor.actor_id);
	assert!(slept.sleep_ts.is_some(), "sleep timestamp persisted");

	// Waking clears sleep_ts atomically with the start transition.
	let value = ctx
		.http_action(&actor.actor_id, "probe", json!(null))
		.await
		.unwrap();
	assert_eq!(value, json!("alive"));
	let awake = ctx.manager().get_for_id(&actor.actor_id).await.unwrap();
	assert!(awake.sleep_ts.is_none());

	ctx.close().await;
}

/// A readonly operation in flight holds the actor awake past its deadline;
/// sleep only fires after a further quiet period.
#[tokio::test]
async fn inflight_readonly_defers_sleep() {
	let ctx = common::TestCtx::new().await;

	let actor = ctx
		.manager()
		.get_or_create_with_key("sleeper", &["busy".to_string()], json!(null))
		.await
		.unwrap();

	// Issue the long readonly shortly before the deadline.
	tokio::time::sleep(SLEEP_TIMEOUT - Duration::from_millis(50)).await;
	let manager = ctx.manager().clone();
	let actor_id = actor.actor_id.clone();
	let linger = tokio::spawn(async move {
		let body = serde_json::to_vec(&json!({"holdMs": 150})).unwrap();
		let req = hyper::Request::builder()
			.method(hyper::Method::POST)
			.uri("/action/linger")
			.body(http_body_util::Full::new(bytes::Bytes::from(body)))
			.unwrap();
		manager.send_request(&actor_id, req).await
	});

	// Past the original deadline, mid-linger: still awake.
	tokio::time::sleep(Duration::from_millis(120)).await;
	let entry = ctx.runtime.registry().get_entry(&actor.actor_id);
	assert!(
		entry.is_some_and(|entry| entry.instance().is_some()),
		"actor must not sleep while a readonly runs"
	);

	linger.await.unwrap().unwrap();

	// A further full timeout of quiet puts it to sleep.
	tokio::time::sleep(SLEEP_TIMEOUT * 3).await;
	assert!(ctx.runtime.registry().get_entry(&actor.actor_id).is_none());

	ctx.close().await;
}
