#![allow(dead_code)]

pub mod actors;

use std::net::SocketAddr;

use bytes::Bytes;
use cleat::{Config, Manager, Runtime};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use serde_json::Value;
use tempfile::TempDir;

/// A runtime over a throwaway storage root. Dropping the ctx leaks nothing;
/// call [`TestCtx::restart`] to simulate a process restart on the same data.
pub struct TestCtx {
	pub runtime: Runtime,
	dir: TempDir,
}

impl TestCtx {
	pub async fn new() -> Self {
		Self::with_dir(tempfile::tempdir().expect("create temp dir")).await
	}

	pub async fn with_dir(dir: TempDir) -> Self {
		let mut config = Config::with_storage_root(dir.path());
		config.gateway.port = Some(portpicker::pick_unused_port().expect("no free port"));
		config.gateway.inspector_token = Some("test-inspector-token".to_string());

		let runtime = Runtime::new(config, actors::definitions())
			.await
			.expect("build runtime");

		TestCtx { runtime, dir }
	}

	pub fn manager(&self) -> &Manager {
		self.runtime.manager()
	}

	pub async fn serve(&mut self) -> SocketAddr {
		self.runtime.serve().await.expect("serve gateway")
	}

	/// Closes the runtime and reopens it over the same storage root.
	pub async fn restart(self) -> Self {
		let TestCtx { runtime, dir } = self;
		runtime.close().await.expect("close runtime");
		Self::with_dir(dir).await
	}

	pub async fn close(self) {
		self.runtime.close().await.expect("close runtime");
	}

	/// Invokes an action through the actor-local HTTP router.
	pub async fn http_action(&self, actor_id: &str, action: &str, args: Value) -> anyhow::Result<Value> {
		let body = serde_json::to_vec(&args).expect("serialize args");
		let req = Request::builder()
			.method(Method::POST)
			.uri(format!("/action/{action}"))
			.body(Full::new(Bytes::from(body)))
			.expect("build request");

		let res = self.manager().send_request(actor_id, req).await?;
		let body = res
			.into_body()
			.collect()
			.await
			.expect("read response body")
			.to_bytes();
		let mut doc: Value = serde_json::from_slice(&body).expect("response is json");
		Ok(doc["output"].take())
	}
}
