use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cleat_config::Config;
use cleat_core::{ActorDefinition, Lifecycle, Registry};
use cleat_store::Store;
use serde_json::{Value, json};

async fn build_registry(
	dir: &tempfile::TempDir,
	definitions: Vec<ActorDefinition>,
) -> Arc<Registry> {
	let config = Config::with_storage_root(dir.path());
	let store = Store::open(dir.path()).await.expect("open store");
	Registry::new(config, store, definitions)
}

fn noop_actor() -> ActorDefinition {
	ActorDefinition::builder("noop")
		.action("ping", |_ctx, _args| async move { Ok(json!("pong")) })
		.build()
}

#[tokio::test]
async fn load_of_unknown_actor_has_no_state() {
	let dir = tempfile::tempdir().unwrap();
	let registry = build_registry(&dir, vec![noop_actor()]).await;

	let entry = registry.load_actor("aaaabbbbccccdddd").await.unwrap();
	assert!(!entry.state_exists());
	assert_eq!(entry.lifecycle(), Lifecycle::Nonexistent);
}

#[tokio::test]
async fn create_persists_and_loads_cold() {
	let dir = tempfile::tempdir().unwrap();

	{
		let registry = build_registry(&dir, vec![noop_actor()]).await;
		registry
			.create_actor("1111222233334444", "noop", &["k".to_string()], Value::Null)
			.await
			.unwrap();
	}

	// A fresh registry over the same storage sees the record.
	let registry = build_registry(&dir, vec![noop_actor()]).await;
	let entry = registry.load_actor("1111222233334444").await.unwrap();
	let state = entry.state().expect("state loaded from disk");
	assert_eq!(state.name, "noop");
	assert_eq!(state.key, vec!["k".to_string()]);
	assert!(state.kv_storage.is_empty());
}

#[tokio::test]
async fn sleep_removes_entry_and_destroy_leaves_tombstone() {
	let dir = tempfile::tempdir().unwrap();
	let registry = build_registry(&dir, vec![noop_actor()]).await;

	let actor_id = "5555666677778888";
	registry
		.create_actor(actor_id, "noop", &[], Value::Null)
		.await
		.unwrap();
	registry.start_actor(actor_id).await.unwrap();

	registry.sleep_actor(actor_id).await.unwrap();
	assert!(registry.get_entry(actor_id).is_none(), "sleep evicts the entry");

	// Cold load finds the sleeping actor and can wake it.
	let entry = registry.load_actor(actor_id).await.unwrap();
	assert!(entry.state().unwrap().sleep_ts.is_some());
	registry.start_actor(actor_id).await.unwrap();
	assert!(
		registry
			.get_entry(actor_id)
			.unwrap()
			.state()
			.unwrap()
			.sleep_ts
			.is_none()
	);

	registry.destroy_actor(actor_id).await.unwrap();
	let entry = registry.get_entry(actor_id).expect("tombstone retained");
	assert_eq!(entry.lifecycle(), Lifecycle::Destroyed);
	assert!(!entry.state_exists());

	// The on-disk record is gone too.
	assert!(registry.store().load_state(actor_id).await.unwrap().is_none());
}

#[tokio::test]
async fn destroy_then_create_rotates_generation() {
	let dir = tempfile::tempdir().unwrap();
	let registry = build_registry(&dir, vec![noop_actor()]).await;

	let actor_id = "9999aaaabbbbcccc";
	let entry = registry
		.create_actor(actor_id, "noop", &[], Value::Null)
		.await
		.unwrap();
	let generation_before = entry.generation();

	registry.destroy_actor(actor_id).await.unwrap();
	let entry = registry
		.create_actor(actor_id, "noop", &[], Value::Null)
		.await
		.unwrap();

	assert_ne!(entry.generation(), generation_before);
	assert_eq!(entry.lifecycle(), Lifecycle::Nonexistent);
}

#[tokio::test]
async fn concurrent_load_or_create_runs_one_create() {
	let dir = tempfile::tempdir().unwrap();

	let creates = Arc::new(AtomicUsize::new(0));
	let counted = creates.clone();
	let definition = ActorDefinition::builder("noop")
		.on_create(move |_input| {
			let counted = counted.clone();
			async move {
				counted.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
		})
		.build();

	let registry = build_registry(&dir, vec![definition]).await;

	let mut handles = Vec::new();
	for _ in 0..10 {
		let registry = registry.clone();
		handles.push(tokio::spawn(async move {
			registry
				.load_or_create_actor("ddddeeeeffff0000", "noop", &[], Value::Null)
				.await
				.unwrap();
		}));
	}
	for handle in handles {
		handle.await.unwrap();
	}

	assert_eq!(creates.load(Ordering::SeqCst), 1, "exactly one create ran");
}
