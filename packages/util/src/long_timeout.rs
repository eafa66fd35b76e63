use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Longest single sleep issued to the timer wheel. Alarms can be scheduled
/// months out, so waits are chained in capped chunks with a cancellation
/// check between each.
const MAX_CHUNK: Duration = Duration::from_secs(60 * 60 * 24);

/// Outcome of [`sleep_until_ms`].
#[derive(Debug, PartialEq, Eq)]
pub enum LongTimeoutResult {
	Elapsed,
	Cancelled,
}

/// Sleeps until `target_ts` (ms since epoch), honoring `cancel` between
/// chunks. Targets in the past elapse immediately.
pub async fn sleep_until_ms(target_ts: i64, cancel: &CancellationToken) -> LongTimeoutResult {
	loop {
		if cancel.is_cancelled() {
			return LongTimeoutResult::Cancelled;
		}

		let remaining = target_ts.saturating_sub(crate::timestamp::now());
		if remaining <= 0 {
			return LongTimeoutResult::Elapsed;
		}

		let chunk = Duration::from_millis(remaining as u64).min(MAX_CHUNK);

		tokio::select! {
			_ = tokio::time::sleep(chunk) => {}
			_ = cancel.cancelled() => return LongTimeoutResult::Cancelled,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn past_target_elapses_immediately() {
		let cancel = CancellationToken::new();
		let res = sleep_until_ms(crate::timestamp::now() - 1_000, &cancel).await;
		assert_eq!(res, LongTimeoutResult::Elapsed);
	}

	#[tokio::test]
	async fn cancellation_wins() {
		let cancel = CancellationToken::new();
		let target = crate::timestamp::now() + 60_000;

		let child = cancel.clone();
		let handle = tokio::spawn(async move { sleep_until_ms(target, &child).await });

		cancel.cancel();
		assert_eq!(handle.await.unwrap(), LongTimeoutResult::Cancelled);
	}
}
