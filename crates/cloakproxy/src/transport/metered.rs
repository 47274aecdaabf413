use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proxy_core::strng::Strng;
use tokio::sync::Notify;
use tracing::debug;

use crate::transport::stream::{ConnState, ConnStateHandler, ConnTracker};

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct Traffic {
	pub sent: u64,
	pub recv: u64,
}

impl Traffic {
	fn since(self, earlier: Traffic) -> Traffic {
		Traffic {
			sent: self.sent.saturating_sub(earlier.sent),
			recv: self.recv.saturating_sub(earlier.recv),
		}
	}
}

/// Receives periodic per-connection traffic reports. The proxy core treats
/// the reporter as opaque; the external stats pipeline (Redis or otherwise)
/// lives entirely behind this callback.
pub trait Reporter: Send + Sync + 'static {
	fn report(
		&self,
		tags: &HashMap<Strng, Strng>,
		cumulative: Traffic,
		delta: Traffic,
		is_final: bool,
	);
}

pub struct NoopReporter;

impl Reporter for NoopReporter {
	fn report(&self, _: &HashMap<Strng, Strng>, _: Traffic, _: Traffic, _: bool) {}
}

/// Handle returned by [`spawn_reporting`]; registered with the connection's
/// tracker so the `Closed` notification flushes the final report.
pub struct MeterHandle {
	closed: Arc<Notify>,
}

impl ConnStateHandler for MeterHandle {
	fn on_state(&self, state: ConnState) {
		if state == ConnState::Closed {
			self.closed.notify_one();
		}
	}
}

/// Start the per-connection reporting task: every `interval` it reports the
/// delta since the previous tick, and after the connection closes it reports
/// once more with the final flag set.
pub fn spawn_reporting(
	tracker: Arc<ConnTracker>,
	reporter: Arc<dyn Reporter>,
	interval: Duration,
) -> Arc<MeterHandle> {
	let closed = Arc::new(Notify::new());
	let handle = Arc::new(MeterHandle {
		closed: closed.clone(),
	});
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		// The first tick completes immediately; skip it so every report covers
		// a full interval.
		ticker.tick().await;
		let mut last = Traffic::default();
		loop {
			tokio::select! {
				_ = ticker.tick() => {
					let (sent, recv) = tracker.stats().load();
					let cumulative = Traffic { sent, recv };
					reporter.report(&tracker.tags(), cumulative, cumulative.since(last), false);
					last = cumulative;
				}
				_ = closed.notified() => {
					let (sent, recv) = tracker.stats().load();
					let cumulative = Traffic { sent, recv };
					reporter.report(&tracker.tags(), cumulative, cumulative.since(last), true);
					debug!(sent, recv, "connection reporting finished");
					return;
				}
			}
		}
	});
	handle
}
