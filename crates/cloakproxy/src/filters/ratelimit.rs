use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::StatusCode;
use indexmap::IndexMap;
use parking_lot::Mutex;
use proxy_core::strng::Strng;

use crate::http::filters::{ConnectionState, Filter, FilterResult, Next, fail};
use crate::http::{Request, request_host};

const DEFAULT_MAX_CLIENTS: usize = 5000;

/// Restricts access to the configured hosts and throttles how often each
/// client (keyed by IP) may hit each of them. Client state lives in an LRU
/// bounded to `max_clients`; the insertion order of the IndexMap doubles as
/// the recency order, so eviction pops the front. Denied requests do not
/// refresh the last-access stamp.
pub struct RateLimit {
	max_clients: usize,
	host_periods: HashMap<Strng, Duration>,
	clients: Mutex<IndexMap<IpAddr, HashMap<Strng, Instant>>>,
}

impl RateLimit {
	/// `max_clients == 0` selects the default of 5000.
	pub fn new(max_clients: usize, host_periods: HashMap<Strng, Duration>) -> RateLimit {
		RateLimit {
			max_clients: if max_clients == 0 {
				DEFAULT_MAX_CLIENTS
			} else {
				max_clients
			},
			host_periods,
			clients: Mutex::new(IndexMap::new()),
		}
	}

	fn check(&self, client: IpAddr, host: &Strng, now: Instant) -> Result<(), String> {
		let Some(period) = self.host_periods.get(host) else {
			return Err(format!("Access to {host} not allowed"));
		};
		let mut clients = self.clients.lock();
		// Re-inserting moves the client to the back, keeping the front the
		// least recently seen.
		let mut accesses = clients.shift_remove(&client).unwrap_or_default();
		let allowed = accesses
			.get(host)
			.map(|last| now.duration_since(*last) > *period)
			.unwrap_or(true);
		if allowed {
			accesses.insert(host.clone(), now);
		}
		clients.insert(client, accesses);
		while clients.len() > self.max_clients {
			clients.shift_remove_index(0);
		}
		if allowed {
			Ok(())
		} else {
			Err(format!("Rate limit for {host} exceeded"))
		}
	}
}

#[async_trait]
impl Filter for RateLimit {
	async fn apply(&self, cs: &ConnectionState, req: Request, next: Next<'_>) -> FilterResult {
		let host = request_host(&req).unwrap_or_default();
		if let Err(description) = self.check(cs.peer_addr.ip(), &host, Instant::now()) {
			return fail(StatusCode::FORBIDDEN, description);
		}
		next.run(cs, req).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn limiter(periods: &[(&str, Duration)]) -> RateLimit {
		RateLimit::new(
			0,
			periods
				.iter()
				.map(|(h, p)| (Strng::from(*h), *p))
				.collect(),
		)
	}

	fn ip(last: u8) -> IpAddr {
		IpAddr::from([10, 0, 0, last])
	}

	#[test]
	fn unknown_host_is_denied() {
		let rl = limiter(&[("allowed.test", Duration::from_millis(50))]);
		let err = rl
			.check(ip(1), &Strng::from("other.test"), Instant::now())
			.unwrap_err();
		assert_eq!(err, "Access to other.test not allowed");
	}

	#[test]
	fn requests_inside_the_period_are_denied() {
		let rl = limiter(&[("h.test", Duration::from_millis(50))]);
		let host = Strng::from("h.test");
		let start = Instant::now();
		assert!(rl.check(ip(1), &host, start).is_ok());
		let err = rl
			.check(ip(1), &host, start + Duration::from_millis(10))
			.unwrap_err();
		assert_eq!(err, "Rate limit for h.test exceeded");
		// Past the period the client is allowed again.
		assert!(
			rl.check(ip(1), &host, start + Duration::from_millis(51))
				.is_ok()
		);
	}

	#[test]
	fn denial_does_not_refresh_last_access() {
		let rl = limiter(&[("h.test", Duration::from_millis(50))]);
		let host = Strng::from("h.test");
		let start = Instant::now();
		assert!(rl.check(ip(1), &host, start).is_ok());
		// Hammering inside the window must not push the next allowance out.
		for ms in [10, 20, 30, 40] {
			assert!(
				rl.check(ip(1), &host, start + Duration::from_millis(ms))
					.is_err()
			);
		}
		assert!(
			rl.check(ip(1), &host, start + Duration::from_millis(51))
				.is_ok()
		);
	}

	#[test]
	fn clients_are_limited_independently() {
		let rl = limiter(&[("h.test", Duration::from_millis(50))]);
		let host = Strng::from("h.test");
		let start = Instant::now();
		assert!(rl.check(ip(1), &host, start).is_ok());
		assert!(rl.check(ip(2), &host, start).is_ok());
		assert!(rl.check(ip(1), &host, start + Duration::from_millis(1)).is_err());
		assert!(rl.check(ip(2), &host, start + Duration::from_millis(1)).is_err());
	}

	#[test]
	fn hosts_are_limited_independently() {
		let rl = limiter(&[
			("a.test", Duration::from_millis(50)),
			("b.test", Duration::from_millis(50)),
		]);
		let start = Instant::now();
		assert!(rl.check(ip(1), &Strng::from("a.test"), start).is_ok());
		assert!(rl.check(ip(1), &Strng::from("b.test"), start).is_ok());
		assert!(
			rl.check(ip(1), &Strng::from("a.test"), start + Duration::from_millis(1))
				.is_err()
		);
	}

	#[test]
	fn oldest_client_is_evicted_at_capacity() {
		let rl = RateLimit::new(
			2,
			[(Strng::from("h.test"), Duration::from_secs(3600))]
				.into_iter()
				.collect(),
		);
		let host = Strng::from("h.test");
		let start = Instant::now();
		assert!(rl.check(ip(1), &host, start).is_ok());
		assert!(rl.check(ip(2), &host, start).is_ok());
		// Touch client 1 so client 2 is the least recently seen.
		assert!(rl.check(ip(1), &host, start + Duration::from_millis(1)).is_err());
		assert!(rl.check(ip(3), &host, start).is_ok());
		// Client 2 was evicted, so its state is gone and it is allowed again
		// despite being inside the period.
		assert!(rl.check(ip(2), &host, start + Duration::from_millis(2)).is_ok());
		// Client 3 is still tracked and still denied.
		assert!(rl.check(ip(3), &host, start + Duration::from_millis(2)).is_err());
	}
}
