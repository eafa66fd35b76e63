use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use cleat_config::Config;
use cleat_core::definition::ActorDefinition;
use cleat_core::{AlarmScheduler, Manager, Registry};
use cleat_store::Store;
use tokio_util::sync::CancellationToken;

use crate::gateway;

/// A running cleat process: storage, registry, alarm scheduler, and
/// optionally the gateway server. Explicit `new`/`close` lifecycle; nothing
/// lives in globals.
pub struct Runtime {
	registry: Arc<Registry>,
	alarms: Arc<AlarmScheduler>,
	manager: Manager,
	gateway: Option<GatewayHandle>,
}

struct GatewayHandle {
	addr: SocketAddr,
	shutdown: CancellationToken,
	join: tokio::task::JoinHandle<()>,
}

impl Runtime {
	/// Opens storage (running recovery and migration), registers the actor
	/// definitions, and re-arms persisted alarms.
	#[tracing::instrument(skip_all)]
	pub async fn new(config: Config, definitions: Vec<ActorDefinition>) -> Result<Self> {
		let store = Store::open(config.storage.root())
			.await
			.context("failed to open storage")?;

		let registry = Registry::new(config, store.clone(), definitions);
		let alarms = AlarmScheduler::new(store, registry.clone());
		alarms.recover().await.context("alarm recovery failed")?;

		Ok(Runtime {
			manager: Manager::new(registry.clone()),
			registry,
			alarms,
			gateway: None,
		})
	}

	pub fn manager(&self) -> &Manager {
		&self.manager
	}

	pub fn registry(&self) -> &Arc<Registry> {
		&self.registry
	}

	/// Binds the gateway and starts serving. Returns the bound address, which
	/// matters when the configured port is 0.
	pub async fn serve(&mut self) -> Result<SocketAddr> {
		anyhow::ensure!(self.gateway.is_none(), "gateway already serving");

		let shutdown = CancellationToken::new();
		let (addr, join) = gateway::serve(self.manager.clone(), shutdown.clone()).await?;
		self.gateway = Some(GatewayHandle {
			addr,
			shutdown,
			join,
		});

		tracing::info!(%addr, "gateway listening");
		Ok(addr)
	}

	pub fn gateway_addr(&self) -> Option<SocketAddr> {
		self.gateway.as_ref().map(|gateway| gateway.addr)
	}

	/// Graceful shutdown: stop accepting, cancel alarm timers, and put every
	/// awake actor to sleep within its drain budgets.
	#[tracing::instrument(skip_all)]
	pub async fn close(self) -> Result<()> {
		if let Some(gateway) = self.gateway {
			gateway.shutdown.cancel();
			let _ = gateway.join.await;
		}

		self.alarms.shutdown();
		self.registry.close().await;

		tracing::info!("runtime closed");
		Ok(())
	}
}
