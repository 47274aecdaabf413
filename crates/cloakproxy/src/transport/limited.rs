use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;
use tracing::trace;

use crate::transport::stream::{ConnState, ConnStateHandler};

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
#[error("network connection already closed")]
pub struct AlreadyClosed;

/// Caps the number of concurrently tracked connections. The accept loop calls
/// [`ConnectionLimit::ready`] before each accept; when the cap is reached the
/// `New` state observation stops accepting, and a close that brings the count
/// back under the cap resumes it. An accept already in flight when `stop`
/// lands is allowed to complete.
pub struct ConnectionLimit {
	max: u64,
	count: AtomicU64,
	stopped: AtomicBool,
	resume: Notify,
}

impl ConnectionLimit {
	/// `max == 0` means unbounded.
	pub fn new(max: u64) -> Arc<ConnectionLimit> {
		Arc::new(ConnectionLimit {
			max: if max == 0 { u64::MAX } else { max },
			count: AtomicU64::new(0),
			stopped: AtomicBool::new(false),
			resume: Notify::new(),
		})
	}

	/// Parks until accepting is allowed.
	pub async fn ready(&self) {
		loop {
			if !self.is_stopped() {
				return;
			}
			let notified = self.resume.notified();
			if !self.is_stopped() {
				return;
			}
			notified.await;
		}
	}

	/// Account for one accepted connection. The returned permit must be
	/// released exactly once when the connection finishes.
	pub fn accepted(self: &Arc<Self>) -> ConnPermit {
		let now = self.count.fetch_add(1, Ordering::SeqCst) + 1;
		trace!(count = now, max = self.max, "accepted connection");
		ConnPermit {
			limit: self.clone(),
			released: AtomicBool::new(false),
		}
	}

	pub fn count(&self) -> u64 {
		self.count.load(Ordering::SeqCst)
	}

	pub fn is_stopped(&self) -> bool {
		self.stopped.load(Ordering::SeqCst)
	}

	pub fn stop(&self) {
		if !self.stopped.swap(true, Ordering::SeqCst) {
			trace!("stopped accepting new connections");
		}
	}

	pub fn restart(&self) {
		if self.stopped.swap(false, Ordering::SeqCst) {
			trace!("accepting new connections again");
			self.resume.notify_waiters();
		}
	}
}

/// One connection's slot against the limit. Implements the state contract:
/// a `New` observation at or over the cap stops the listener; the one-shot
/// release on `Closed` resumes it once the count drops back under.
pub struct ConnPermit {
	limit: Arc<ConnectionLimit>,
	released: AtomicBool,
}

impl ConnPermit {
	pub fn release(&self) -> Result<(), AlreadyClosed> {
		if self.released.swap(true, Ordering::SeqCst) {
			return Err(AlreadyClosed);
		}
		let left = self.limit.count.fetch_sub(1, Ordering::SeqCst) - 1;
		trace!(count = left, "closed a connection");
		if left < self.limit.max && self.limit.is_stopped() {
			self.limit.restart();
		}
		Ok(())
	}
}

impl ConnStateHandler for ConnPermit {
	fn on_state(&self, state: ConnState) {
		match state {
			ConnState::New => {
				let l = &self.limit;
				if l.count() >= l.max {
					trace!(count = l.count(), max = l.max, "connection cap reached");
					l.stop();
				} else if l.is_stopped() {
					l.restart();
				}
			},
			ConnState::Closed => {
				let _ = self.release();
			},
			_ => {},
		}
	}
}

impl Drop for ConnPermit {
	fn drop(&mut self) {
		// Safety net for paths that never report Closed (e.g. a panic in the
		// connection task).
		let _ = self.release();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn count_tracks_accepts_and_closes() {
		let limit = ConnectionLimit::new(10);
		let a = limit.accepted();
		let b = limit.accepted();
		assert_eq!(limit.count(), 2);
		a.release().unwrap();
		assert_eq!(limit.count(), 1);
		b.release().unwrap();
		assert_eq!(limit.count(), 0);
	}

	#[test]
	fn double_close_errors_without_double_decrement() {
		let limit = ConnectionLimit::new(10);
		let a = limit.accepted();
		let _b = limit.accepted();
		assert_eq!(a.release(), Ok(()));
		assert_eq!(a.release(), Err(AlreadyClosed));
		assert_eq!(limit.count(), 1);
	}

	#[test]
	fn cap_stops_and_close_restarts() {
		let limit = ConnectionLimit::new(2);
		let a = limit.accepted();
		a.on_state(ConnState::New);
		assert!(!limit.is_stopped());
		let b = limit.accepted();
		b.on_state(ConnState::New);
		assert!(limit.is_stopped());
		b.on_state(ConnState::Closed);
		assert!(!limit.is_stopped());
		assert_eq!(limit.count(), 1);
		drop(a);
		assert_eq!(limit.count(), 0);
	}

	#[tokio::test]
	async fn ready_parks_until_restart() {
		let limit = ConnectionLimit::new(1);
		limit.stop();
		let waiter = {
			let limit = limit.clone();
			tokio::spawn(async move {
				limit.ready().await;
			})
		};
		tokio::task::yield_now().await;
		assert!(!waiter.is_finished());
		limit.restart();
		waiter.await.unwrap();
	}

	#[test]
	fn zero_means_unbounded() {
		let limit = ConnectionLimit::new(0);
		let p = limit.accepted();
		p.on_state(ConnState::New);
		assert!(!limit.is_stopped());
	}
}
