use std::net::IpAddr;

use async_trait::async_trait;
use http::StatusCode;
use tracing::warn;

use crate::http::filters::{ConnectionState, Filter, FilterResult, Next, fail};
use crate::http::{Request, request_authority, split_host_port};

/// Refuses to proxy to the machine the proxy itself runs on. Interface
/// addresses are enumerated once at construction; the exception list is
/// matched case-insensitively against both the bare host and `host:port`.
pub struct BlockLocal {
	exceptions: Vec<String>,
	local_ips: Vec<IpAddr>,
}

impl BlockLocal {
	pub fn new(exceptions: Vec<String>) -> BlockLocal {
		let local_ips = match local_ip_address::list_afinet_netifas() {
			Ok(ifas) => ifas.into_iter().map(|(_, ip)| ip).collect(),
			Err(e) => {
				warn!("error enumerating local addresses: {e}");
				Vec::new()
			},
		};
		BlockLocal {
			exceptions,
			local_ips,
		}
	}

	fn is_exception(&self, host: &str, authority: &str) -> bool {
		self
			.exceptions
			.iter()
			.any(|e| e.eq_ignore_ascii_case(host) || e.eq_ignore_ascii_case(authority))
	}
}

#[async_trait]
impl Filter for BlockLocal {
	async fn apply(&self, cs: &ConnectionState, req: Request, next: Next<'_>) -> FilterResult {
		let Some(authority) = request_authority(&req) else {
			return next.run(cs, req).await;
		};
		let (host, _) = split_host_port(&authority);
		if self.is_exception(host, &authority) {
			return next.run(cs, req).await;
		}
		// A resolution failure just means the name is not an address we can
		// reason about; let the dial surface any real problem.
		let resolved = tokio::net::lookup_host((host, 0u16))
			.await
			.ok()
			.and_then(|mut addrs| addrs.next());
		if let Some(addr) = resolved {
			let ip = addr.ip();
			if ip.is_loopback() {
				return fail(
					StatusCode::FORBIDDEN,
					format!(
						"{} requested loopback address {} ({})",
						cs.peer_addr, authority, ip
					),
				);
			}
			if self.local_ips.contains(&ip) {
				return fail(
					StatusCode::FORBIDDEN,
					format!(
						"{} requested local address {} ({})",
						cs.peer_addr, authority, ip
					),
				);
			}
		}
		next.run(cs, req).await
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use proxy_core::copy::ConnectionStats;

	use super::*;
	use crate::http::filters::{FilterChain, FilterError, Terminal, Verdict};
	use crate::http::{Body, plain_response};
	use crate::transport::stream::ConnTracker;

	struct Reached;
	#[async_trait]
	impl Terminal for Reached {
		async fn dispatch(&self, _cs: &ConnectionState, _req: Request) -> FilterResult {
			Ok(Verdict::Respond(plain_response(StatusCode::OK, "reached")))
		}
	}

	fn state() -> ConnectionState {
		ConnectionState::new(
			"127.0.0.1:5000".parse().unwrap(),
			ConnTracker::new(ConnectionStats::new()),
		)
	}

	fn get(url: &str) -> Request {
		::http::Request::builder()
			.uri(url)
			.body(Body::empty())
			.unwrap()
	}

	async fn run(filter: BlockLocal, req: Request) -> Result<Verdict, FilterError> {
		let chain = FilterChain::new(vec![Arc::new(filter)]);
		chain.run(&state(), req, &Reached).await
	}

	#[tokio::test]
	async fn loopback_is_blocked() {
		let err = run(BlockLocal::new(vec![]), get("http://127.0.0.1:7300/x"))
			.await
			.unwrap_err();
		assert_eq!(err.status, StatusCode::FORBIDDEN);
		assert!(err.description.contains("loopback"));
	}

	#[tokio::test]
	async fn localhost_name_is_blocked() {
		let err = run(BlockLocal::new(vec![]), get("http://localhost:7300/x"))
			.await
			.unwrap_err();
		assert_eq!(err.status, StatusCode::FORBIDDEN);
	}

	#[tokio::test]
	async fn exceptions_are_allowed_case_insensitively() {
		let verdict = run(
			BlockLocal::new(vec!["LocalHost".to_string()]),
			get("http://localhost:7300/x"),
		)
		.await
		.unwrap();
		assert!(matches!(verdict, Verdict::Respond(_)));
	}

	#[tokio::test]
	async fn remote_hosts_pass() {
		// Documentation range addresses never land on a local interface.
		let verdict = run(BlockLocal::new(vec![]), get("http://192.0.2.10/"))
			.await
			.unwrap();
		assert!(matches!(verdict, Verdict::Respond(_)));
	}
}
