use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use cleat_error::ErrorParts;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::errors;

/// Most operations a single actor will queue before new admissions are
/// rejected with `queue.full`. Readonly operations never queue and are not
/// subject to the bound.
const MAX_QUEUED_OPS: usize = 1024;

/// Concurrency class of an operation on one actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
	/// Exclusive: waits for everything running, blocks everything while it
	/// runs. The default.
	Serial,
	/// Waits for running serial operations; runs alongside other parallel and
	/// readonly operations.
	Parallel,
	/// Starts immediately, concurrent with anything.
	Readonly,
}

impl Default for OpMode {
	fn default() -> Self {
		OpMode::Serial
	}
}

/// Per-actor admission control for operations.
///
/// Admission rules:
/// - serial: no serial or parallel running, and this waiter is at the head of
///   the FIFO;
/// - parallel: no serial running and no serial waiter queued ahead, so a
///   stream of parallel operations cannot starve a queued serial;
/// - readonly: never queues.
///
/// The waiter FIFO is bounded; once full, further serial/parallel admissions
/// fail with `queue.full` instead of piling up behind a stuck operation.
pub struct OpScheduler {
	inner: Arc<Mutex<SchedState>>,
}

#[derive(Debug)]
struct SchedState {
	running_serial: usize,
	running_parallel: usize,
	running_readonly: usize,
	closed: bool,
	queue: VecDeque<Waiter>,
}

#[derive(Debug)]
struct Waiter {
	mode: OpMode,
	tx: oneshot::Sender<OpPermit>,
}

impl OpScheduler {
	pub fn new() -> Self {
		OpScheduler {
			inner: Arc::new(Mutex::new(SchedState {
				running_serial: 0,
				running_parallel: 0,
				running_readonly: 0,
				closed: false,
				queue: VecDeque::new(),
			})),
		}
	}

	/// Waits for admission. Fails with `actor.aborted` once the scheduler has
	/// been closed.
	pub async fn acquire(&self, mode: OpMode) -> Result<OpPermit> {
		let rx = {
			let mut state = self.inner.lock();
			if state.closed {
				return Err(errors::Actor::Aborted.build());
			}

			if mode == OpMode::Readonly {
				state.running_readonly += 1;
				return Ok(OpPermit {
					sched: self.inner.clone(),
					mode,
					released: false,
				});
			}

			if state.queue.len() >= MAX_QUEUED_OPS {
				return Err(errors::Queue::Full {
					max: MAX_QUEUED_OPS,
				}
				.build());
			}

			let (tx, rx) = oneshot::channel();
			state.queue.push_back(Waiter { mode, tx });
			Self::pump(&self.inner, &mut state);
			rx
		};

		rx.await.map_err(|_| errors::Actor::Aborted.build())
	}

	/// True when nothing is running and nothing is queued. Drives the
	/// inactivity sleep check.
	pub fn is_idle(&self) -> bool {
		let state = self.inner.lock();
		state.running_serial == 0
			&& state.running_parallel == 0
			&& state.running_readonly == 0
			&& state.queue.is_empty()
	}

	/// Rejects all queued waiters and refuses new admissions. Running
	/// operations keep their permits until they finish.
	pub fn close(&self) {
		let mut state = self.inner.lock();
		state.closed = true;
		// Dropping the senders rejects the waiters with `actor.aborted`.
		state.queue.clear();
	}

	/// Grants as many queued waiters as the admission rules allow. Waiters
	/// whose receiver is gone (cancelled while queued) are skipped.
	fn pump(inner: &Arc<Mutex<SchedState>>, state: &mut SchedState) {
		while let Some(head) = state.queue.front() {
			let admissible = match head.mode {
				OpMode::Serial => state.running_serial == 0 && state.running_parallel == 0,
				OpMode::Parallel => state.running_serial == 0,
				OpMode::Readonly => unreachable!("readonly never queues"),
			};
			if !admissible {
				break;
			}

			let waiter = state.queue.pop_front().expect("head exists");
			match waiter.mode {
				OpMode::Serial => state.running_serial += 1,
				OpMode::Parallel => state.running_parallel += 1,
				OpMode::Readonly => unreachable!(),
			}

			let permit = OpPermit {
				sched: inner.clone(),
				mode: waiter.mode,
				released: false,
			};
			if let Err(mut permit) = waiter.tx.send(permit) {
				// Receiver dropped while queued. Undo the count here and
				// defuse the permit so its Drop does not re-lock the state.
				match permit.mode {
					OpMode::Serial => state.running_serial -= 1,
					OpMode::Parallel => state.running_parallel -= 1,
					OpMode::Readonly => unreachable!(),
				}
				permit.released = true;
				continue;
			}

			if waiter.mode == OpMode::Serial {
				// A running serial blocks everything behind it.
				break;
			}
		}
	}

	fn release(inner: &Arc<Mutex<SchedState>>, mode: OpMode) {
		let mut state = inner.lock();
		match mode {
			OpMode::Serial => state.running_serial -= 1,
			OpMode::Parallel => state.running_parallel -= 1,
			OpMode::Readonly => state.running_readonly -= 1,
		}
		Self::pump(inner, &mut state);
	}
}

impl Default for OpScheduler {
	fn default() -> Self {
		Self::new()
	}
}

/// RAII admission slot. The slot is released when the permit drops, i.e.
/// after the operation's handler (or its cancellation) has unwound.
#[derive(Debug)]
pub struct OpPermit {
	sched: Arc<Mutex<SchedState>>,
	mode: OpMode,
	/// Set when the slot was already given back inline (dead waiter path).
	released: bool,
}

impl Drop for OpPermit {
	fn drop(&mut self) {
		if self.released {
			return;
		}
		OpScheduler::release(&self.sched, self.mode);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	#[tokio::test]
	async fn serial_is_exclusive() {
		let sched = Arc::new(OpScheduler::new());
		let running = Arc::new(AtomicUsize::new(0));
		let max_seen = Arc::new(AtomicUsize::new(0));

		let mut handles = Vec::new();
		for _ in 0..20 {
			let sched = sched.clone();
			let running = running.clone();
			let max_seen = max_seen.clone();
			handles.push(tokio::spawn(async move {
				let _permit = sched.acquire(OpMode::Serial).await.unwrap();
				let now = running.fetch_add(1, Ordering::SeqCst) + 1;
				max_seen.fetch_max(now, Ordering::SeqCst);
				tokio::time::sleep(Duration::from_millis(1)).await;
				running.fetch_sub(1, Ordering::SeqCst);
			}));
		}
		for handle in handles {
			handle.await.unwrap();
		}

		assert_eq!(max_seen.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn parallel_waits_for_serial() {
		let sched = Arc::new(OpScheduler::new());

		let serial = sched.acquire(OpMode::Serial).await.unwrap();

		let sched2 = sched.clone();
		let parallel = tokio::spawn(async move { sched2.acquire(OpMode::Parallel).await });

		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(!parallel.is_finished());

		drop(serial);
		parallel.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn queued_serial_is_not_starved_by_parallel() {
		let sched = Arc::new(OpScheduler::new());

		// A running parallel, then a queued serial, then more parallels.
		let first_parallel = sched.acquire(OpMode::Parallel).await.unwrap();

		let sched2 = sched.clone();
		let queued_serial = tokio::spawn(async move { sched2.acquire(OpMode::Serial).await });
		tokio::time::sleep(Duration::from_millis(5)).await;

		let sched3 = sched.clone();
		let late_parallel = tokio::spawn(async move { sched3.acquire(OpMode::Parallel).await });
		tokio::time::sleep(Duration::from_millis(5)).await;

		// The late parallel must be stuck behind the queued serial.
		assert!(!late_parallel.is_finished());

		drop(first_parallel);
		let serial_permit = queued_serial.await.unwrap().unwrap();
		tokio::time::sleep(Duration::from_millis(5)).await;
		assert!(!late_parallel.is_finished());

		drop(serial_permit);
		late_parallel.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn readonly_never_queues() {
		let sched = OpScheduler::new();
		let _serial = sched.acquire(OpMode::Serial).await.unwrap();
		// Admitted immediately even with a serial running.
		let _readonly = sched.acquire(OpMode::Readonly).await.unwrap();
		assert!(!sched.is_idle());
	}

	#[tokio::test]
	async fn close_rejects_waiters() {
		let sched = Arc::new(OpScheduler::new());
		let _serial = sched.acquire(OpMode::Serial).await.unwrap();

		let sched2 = sched.clone();
		let waiter = tokio::spawn(async move { sched2.acquire(OpMode::Serial).await });
		tokio::time::sleep(Duration::from_millis(5)).await;

		sched.close();
		let err = waiter.await.unwrap().unwrap_err();
		assert_eq!(
			cleat_error::CleatError::extract(&err).code_path(),
			"actor.aborted"
		);

		let err = sched.acquire(OpMode::Readonly).await.unwrap_err();
		assert_eq!(
			cleat_error::CleatError::extract(&err).code_path(),
			"actor.aborted"
		);
	}

	#[tokio::test]
	async fn full_queue_rejects_new_waiters() {
		let sched = Arc::new(OpScheduler::new());
		let _running = sched.acquire(OpMode::Serial).await.unwrap();

		let mut waiters = Vec::new();
		for _ in 0..MAX_QUEUED_OPS {
			let sched = sched.clone();
			waiters.push(tokio::spawn(async move { sched.acquire(OpMode::Serial).await }));
		}
		// Let every waiter reach the queue.
		while sched.inner.lock().queue.len() < MAX_QUEUED_OPS {
			tokio::time::sleep(Duration::from_millis(1)).await;
		}

		let err = sched.acquire(OpMode::Serial).await.unwrap_err();
		assert_eq!(
			cleat_error::CleatError::extract(&err).code_path(),
			"queue.full"
		);

		// Readonly is exempt from the bound.
		let _readonly = sched.acquire(OpMode::Readonly).await.unwrap();

		sched.close();
		for waiter in waiters {
			let _ = waiter.await;
		}
	}

	#[tokio::test]
	async fn cancelled_waiter_does_not_leak_slot() {
		let sched = Arc::new(OpScheduler::new());
		let serial = sched.acquire(OpMode::Serial).await.unwrap();

		let sched2 = sched.clone();
		let waiter = tokio::spawn(async move { sched2.acquire(OpMode::Serial).await });
		tokio::time::sleep(Duration::from_millis(5)).await;
		waiter.abort();
		let _ = waiter.await;

		drop(serial);
		// The abandoned waiter must not hold the scheduler hostage.
		let _next = sched.acquire(OpMode::Serial).await.unwrap();
	}
}
