mod common;

use serde_json::json;

/// 100 interleaving-hostile increments must all land: the handler reads,
/// yields, then writes, so any violation of serial exclusion loses updates.
#[tokio::test]
async fn concurrent_serial_actions_do_not_interleave() {
	let ctx = common::TestCtx::new().await;

	let actor = ctx
		.manager()
		.get_or_create_with_key("counter", &["serial".to_string()], json!({"init": 0}))
		.await
		.unwrap();

	let mut handles = Vec::new();
	for _ in 0..100 {
		let manager = ctx.manager().clone();
		let actor_id = actor.actor_id.clone();
		handles.push(tokio::spawn(async move {
			let body = serde_json::to_vec(&json!(null)).unwrap();
			let req = hyper::Request::builder()
				.method(hyper::Method::POST)
				.uri("/action/increment")
				.body(http_body_util::Full::new(bytes::Bytes::from(body)))
				.unwrap();
			manager.send_request(&actor_id, req).await.unwrap();
		}));
	}
	for handle in handles {
		handle.await.unwrap();
	}

	let value = ctx.http_action(&actor.actor_id, "get", json!(null)).await.unwrap();
	assert_eq!(value, json!(100));

	ctx.close().await;
}

#[tokio::test]
async fn unknown_action_is_not_found() {
	let ctx = common::TestCtx::new().await;

	let actor = ctx
		.manager()
		.get_or_create_with_key("counter", &["missing-action".to_string()], json!(null))
		.await
		.unwrap();

	let err = ctx
		.http_action(&actor.actor_id, "does-not-exist", json!(null))
		.await
		.unwrap_err();
	assert_eq!(
		cleat::CleatError::extract(&err).code_path(),
		"action.not_found"
	);

	ctx.close().await;
}
