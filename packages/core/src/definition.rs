use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body_util::Full;
use hyper::{Request, Response};
use serde_json::Value;

use crate::conn::ConnHandle;
use crate::instance::ActorContext;
use crate::scheduler::OpMode;
use cleat_gateway_core::WebSocketHandle;

pub type ActionFn = Arc<dyn Fn(ActorContext, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
pub type HookFn = Arc<dyn Fn(ActorContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type CreateHookFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type StateChangeFn =
	Arc<dyn Fn(ActorContext, Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type BeforeConnectFn =
	Arc<dyn Fn(ActorContext, Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type CreateConnStateFn =
	Arc<dyn Fn(ActorContext, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
pub type ConnHookFn =
	Arc<dyn Fn(ActorContext, ConnHandle) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type BeforeActionResponseFn = Arc<
	dyn Fn(ActorContext, String, Value, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync,
>;
pub type CanInvokeFn =
	Arc<dyn Fn(ActorContext, InvokeTarget) -> BoxFuture<'static, Result<bool>> + Send + Sync>;
pub type RequestFn = Arc<
	dyn Fn(ActorContext, Request<Full<Bytes>>) -> BoxFuture<'static, Result<Response<Full<Bytes>>>>
		+ Send
		+ Sync,
>;
pub type WebSocketFn = Arc<
	dyn Fn(ActorContext, WebSocketHandle, String) -> BoxFuture<'static, Result<()>> + Send + Sync,
>;
pub type RunFn = Arc<dyn Fn(ActorContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type InitialKvFn = Arc<dyn Fn(&Value) -> Result<Vec<(Vec<u8>, Vec<u8>)>> + Send + Sync>;

/// What an authorization check is being asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeTarget {
	Action { name: String },
	Subscribe { name: String },
}

/// A named callable on an actor.
pub struct Action {
	pub(crate) mode: OpMode,
	pub(crate) timeout: Option<Duration>,
	pub(crate) handler: ActionFn,
}

#[derive(Default)]
pub(crate) struct Hooks {
	pub on_create: Option<CreateHookFn>,
	pub on_destroy: Option<HookFn>,
	pub on_wake: Option<HookFn>,
	pub on_sleep: Option<HookFn>,
	pub on_state_change: Option<StateChangeFn>,
	pub on_before_connect: Option<BeforeConnectFn>,
	pub create_conn_state: Option<CreateConnStateFn>,
	pub on_connect: Option<ConnHookFn>,
	pub on_disconnect: Option<ConnHookFn>,
	pub on_before_action_response: Option<BeforeActionResponseFn>,
	pub can_invoke: Option<CanInvokeFn>,
	pub on_request: Option<RequestFn>,
	pub on_websocket: Option<WebSocketFn>,
	pub on_alarm: Option<HookFn>,
}

/// Per-definition overrides of the runtime config.
#[derive(Debug, Clone, Default)]
pub struct ActorOptions {
	pub sleep_timeout: Option<Duration>,
	pub no_sleep: Option<bool>,
	pub action_timeout: Option<Duration>,
}

/// Everything the runtime needs to know about one actor name: lifecycle
/// hooks, actions, the optional long-running `run` handler, and the seed for
/// a fresh actor's KV store.
pub struct ActorDefinition {
	pub name: String,
	pub(crate) actions: HashMap<String, Action>,
	pub(crate) hooks: Hooks,
	pub(crate) run: Option<RunFn>,
	pub(crate) initial_kv: Option<InitialKvFn>,
	pub(crate) options: ActorOptions,
}

impl ActorDefinition {
	pub fn builder(name: impl Into<String>) -> ActorDefinitionBuilder {
		ActorDefinitionBuilder {
			def: ActorDefinition {
				name: name.into(),
				actions: HashMap::new(),
				hooks: Hooks::default(),
				run: None,
				initial_kv: None,
				options: ActorOptions::default(),
			},
		}
	}

	pub(crate) fn action(&self, name: &str) -> Option<&Action> {
		self.actions.get(name)
	}
}

pub struct ActorDefinitionBuilder {
	def: ActorDefinition,
}

impl ActorDefinitionBuilder {
	/// Registers a serial action.
	pub fn action<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
	where
		F: Fn(ActorContext, Value) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value>> + Send + 'static,
	{
		self.action_with(name, OpMode::Serial, None, handler)
	}

	/// Registers an action with an explicit concurrency mode and optional
	/// timeout override.
	pub fn action_with<F, Fut>(
		mut self,
		name: impl Into<String>,
		mode: OpMode,
		timeout: Option<Duration>,
		handler: F,
	) -> Self
	where
		F: Fn(ActorContext, Value) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value>> + Send + 'static,
	{
		self.def.actions.insert(
			name.into(),
			Action {
				mode,
				timeout,
				handler: Arc::new(move |ctx, args| Box::pin(handler(ctx, args))),
			},
		);
		self
	}

	pub fn on_create<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn(Value) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.hooks.on_create = Some(Arc::new(move |input| Box::pin(hook(input))));
		self
	}

	pub fn on_destroy<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn(ActorContext) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.hooks.on_destroy = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
		self
	}

	pub fn on_wake<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn(ActorContext) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.hooks.on_wake = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
		self
	}

	pub fn on_sleep<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn(ActorContext) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.hooks.on_sleep = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
		self
	}

	pub fn on_state_change<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn(ActorContext, Value) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.hooks.on_state_change = Some(Arc::new(move |ctx, state| Box::pin(hook(ctx, state))));
		self
	}

	pub fn on_before_connect<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn(ActorContext, Value) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.hooks.on_before_connect =
			Some(Arc::new(move |ctx, params| Box::pin(hook(ctx, params))));
		self
	}

	pub fn create_conn_state<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn(ActorContext, Value) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value>> + Send + 'static,
	{
		self.def.hooks.create_conn_state =
			Some(Arc::new(move |ctx, params| Box::pin(hook(ctx, params))));
		self
	}

	pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn(ActorContext, ConnHandle) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.hooks.on_connect = Some(Arc::new(move |ctx, conn| Box::pin(hook(ctx, conn))));
		self
	}

	pub fn on_disconnect<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn(ActorContext, ConnHandle) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.hooks.on_disconnect = Some(Arc::new(move |ctx, conn| Box::pin(hook(ctx, conn))));
		self
	}

	pub fn on_before_action_response<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn(ActorContext, String, Value, Value) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value>> + Send + 'static,
	{
		self.def.hooks.on_before_action_response = Some(Arc::new(move |ctx, name, args, output| {
			Box::pin(hook(ctx, name, args, output))
		}));
		self
	}

	pub fn can_invoke<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn(ActorContext, InvokeTarget) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<bool>> + Send + 'static,
	{
		self.def.hooks.can_invoke = Some(Arc::new(move |ctx, target| Box::pin(hook(ctx, target))));
		self
	}

	pub fn on_request<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn(ActorContext, Request<Full<Bytes>>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Response<Full<Bytes>>>> + Send + 'static,
	{
		self.def.hooks.on_request = Some(Arc::new(move |ctx, req| Box::pin(hook(ctx, req))));
		self
	}

	pub fn on_websocket<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn(ActorContext, WebSocketHandle, String) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.hooks.on_websocket =
			Some(Arc::new(move |ctx, ws, path| Box::pin(hook(ctx, ws, path))));
		self
	}

	pub fn on_alarm<F, Fut>(mut self, hook: F) -> Self
	where
		F: Fn(ActorContext) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.hooks.on_alarm = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
		self
	}

	/// Long-running background handler, launched after start. If it returns
	/// or fails the actor crashes and is restarted.
	pub fn run<F, Fut>(mut self, handler: F) -> Self
	where
		F: Fn(ActorContext) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.run = Some(Arc::new(move |ctx| Box::pin(handler(ctx))));
		self
	}

	/// Maps creation input into the seed entries for the fresh KV store.
	pub fn initial_kv<F>(mut self, f: F) -> Self
	where
		F: Fn(&Value) -> Result<Vec<(Vec<u8>, Vec<u8>)>> + Send + Sync + 'static,
	{
		self.def.initial_kv = Some(Arc::new(f));
		self
	}

	pub fn options(mut self, options: ActorOptions) -> Self {
		self.def.options = options;
		self
	}

	pub fn build(self) -> ActorDefinition {
		self.def
	}
}
