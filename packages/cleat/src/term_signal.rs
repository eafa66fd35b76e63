use anyhow::Result;

/// Resolves when the process receives a termination signal: SIGTERM or
/// SIGINT on unix, Ctrl+C elsewhere.
pub async fn wait_for_term() -> Result<()> {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};

		let mut sigterm = signal(SignalKind::terminate())?;
		let mut sigint = signal(SignalKind::interrupt())?;

		tokio::select! {
			_ = sigterm.recv() => tracing::info!("received SIGTERM"),
			_ = sigint.recv() => tracing::info!("received SIGINT"),
		}
	}

	#[cfg(not(unix))]
	{
		tokio::signal::ctrl_c().await?;
		tracing::info!("received Ctrl+C");
	}

	Ok(())
}
