use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use proxy_core::strng::Strng;
use tracing::trace;

use crate::transport::metered::{Reporter, Traffic};

/// Per-client accounting, keyed by the opaque device id delivered through the
/// connection tag map. Records are created on first sight and updated as
/// bytes flow; the external reporter visits snapshots periodically.
pub struct ClientRecord {
	created: SystemTime,
	last_access: AtomicU64,
	bytes_in: AtomicU64,
	bytes_out: AtomicU64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientSnapshot {
	pub created: SystemTime,
	pub last_access: SystemTime,
	pub bytes_in: u64,
	pub bytes_out: u64,
}

impl ClientRecord {
	fn new() -> ClientRecord {
		ClientRecord {
			created: SystemTime::now(),
			last_access: AtomicU64::new(unix_secs(SystemTime::now())),
			bytes_in: AtomicU64::new(0),
			bytes_out: AtomicU64::new(0),
		}
	}

	pub fn add_traffic(&self, bytes_in: u64, bytes_out: u64) {
		self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
		self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
		self
			.last_access
			.store(unix_secs(SystemTime::now()), Ordering::Relaxed);
	}

	pub fn snapshot(&self) -> ClientSnapshot {
		ClientSnapshot {
			created: self.created,
			last_access: UNIX_EPOCH + Duration::from_secs(self.last_access.load(Ordering::Relaxed)),
			bytes_in: self.bytes_in.load(Ordering::Relaxed),
			bytes_out: self.bytes_out.load(Ordering::Relaxed),
		}
	}
}

fn unix_secs(t: SystemTime) -> u64 {
	t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[derive(Default)]
pub struct Registry {
	clients: Mutex<HashMap<Strng, Arc<ClientRecord>>>,
}

impl Registry {
	pub fn new() -> Arc<Registry> {
		Arc::new(Registry::default())
	}

	/// Fetch or create the record for a device id.
	pub fn client(&self, id: &Strng) -> Arc<ClientRecord> {
		self
			.clients
			.lock()
			.entry(id.clone())
			.or_insert_with(|| Arc::new(ClientRecord::new()))
			.clone()
	}

	pub fn len(&self) -> usize {
		self.clients.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.clients.lock().is_empty()
	}

	/// Visit a snapshot of every client. The callback runs without the
	/// registry lock held, so it may do slow work.
	pub fn scan(&self, mut f: impl FnMut(&Strng, ClientSnapshot)) {
		let snapshot: Vec<(Strng, Arc<ClientRecord>)> = self
			.clients
			.lock()
			.iter()
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect();
		for (id, record) in snapshot {
			f(&id, record.snapshot());
		}
	}

	/// Periodically scan all clients, feeding each snapshot to `f`. This is
	/// the hook the external stats reporter consumes.
	pub fn spawn_scanner(
		self: &Arc<Self>,
		period: Duration,
		f: impl Fn(&Strng, ClientSnapshot) + Send + Sync + 'static,
	) -> tokio::task::JoinHandle<()> {
		let registry = self.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.tick().await;
			loop {
				ticker.tick().await;
				registry.scan(|id, snap| f(id, snap));
			}
		})
	}
}

/// Bridges the metered listener's per-connection reports into the client
/// registry, using the `client` tag attached by the device filter.
pub struct RegistryReporter {
	registry: Arc<Registry>,
}

impl RegistryReporter {
	pub fn new(registry: Arc<Registry>) -> RegistryReporter {
		RegistryReporter { registry }
	}
}

impl Reporter for RegistryReporter {
	fn report(
		&self,
		tags: &HashMap<Strng, Strng>,
		_cumulative: Traffic,
		delta: Traffic,
		is_final: bool,
	) {
		let Some(id) = tags.get("client") else {
			return;
		};
		if delta.sent == 0 && delta.recv == 0 && !is_final {
			return;
		}
		trace!(client = id.as_str(), ?delta, is_final, "client traffic");
		self.registry.client(id).add_traffic(delta.recv, delta.sent);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn records_accumulate() {
		let registry = Registry::new();
		let id: Strng = "dev-1".into();
		registry.client(&id).add_traffic(10, 20);
		registry.client(&id).add_traffic(5, 0);
		let snap = registry.client(&id).snapshot();
		assert_eq!(snap.bytes_in, 15);
		assert_eq!(snap.bytes_out, 20);
		assert_eq!(registry.len(), 1);
	}

	#[test]
	fn reporter_uses_client_tag() {
		let registry = Registry::new();
		let reporter = RegistryReporter::new(registry.clone());
		let mut tags = HashMap::new();
		tags.insert(Strng::from("client"), Strng::from("dev-9"));
		reporter.report(
			&tags,
			Traffic { sent: 30, recv: 12 },
			Traffic { sent: 30, recv: 12 },
			false,
		);
		let snap = registry.client(&Strng::from("dev-9")).snapshot();
		// Bytes read from the client are bytes-in; bytes written are bytes-out.
		assert_eq!(snap.bytes_in, 12);
		assert_eq!(snap.bytes_out, 30);
	}

	#[test]
	fn untagged_connections_are_ignored() {
		let registry = Registry::new();
		let reporter = RegistryReporter::new(registry.clone());
		reporter.report(
			&HashMap::new(),
			Traffic { sent: 5, recv: 5 },
			Traffic { sent: 5, recv: 5 },
			true,
		);
		assert!(registry.is_empty());
	}

	#[test]
	fn scan_visits_all() {
		let registry = Registry::new();
		registry.client(&Strng::from("a")).add_traffic(1, 0);
		registry.client(&Strng::from("b")).add_traffic(2, 0);
		let mut seen = Vec::new();
		registry.scan(|id, snap| seen.push((id.clone(), snap.bytes_in)));
		seen.sort();
		assert_eq!(seen, vec![(Strng::from("a"), 1), (Strng::from("b"), 2)]);
	}
}
