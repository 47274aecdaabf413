use async_trait::async_trait;
use http::{Method, StatusCode};
use tracing::trace;

use crate::http::filters::{ConnectionState, Filter, FilterResult, Next, fail};
use crate::http::{Request, request_authority, split_host_port};

/// Restricts CONNECT requests to an allow-list of ports: 400 when the target
/// has no usable port, 403 when the port is outside the list. An empty list
/// allows everything.
pub struct RestrictConnectPorts {
	allowed: Vec<u16>,
}

impl RestrictConnectPorts {
	pub fn new(allowed: Vec<u16>) -> RestrictConnectPorts {
		RestrictConnectPorts { allowed }
	}
}

#[async_trait]
impl Filter for RestrictConnectPorts {
	async fn apply(&self, cs: &ConnectionState, req: Request, next: Next<'_>) -> FilterResult {
		if req.method() != Method::CONNECT || self.allowed.is_empty() {
			return next.run(cs, req).await;
		}
		let target = request_authority(&req).unwrap_or_default();
		trace!(dst = target.as_str(), allowed = ?self.allowed, "checking CONNECT tunnel port");
		let (_, port) = split_host_port(&target);
		let Some(port) = port else {
			// A CONNECT request-URI always carries a port (RFC 2817 section 5.2).
			return fail(
				StatusCode::BAD_REQUEST,
				"No port field in Request-URI / Host header",
			);
		};
		let parsed: u16 = match port.parse() {
			Ok(p) => p,
			Err(_) => {
				return fail(
					StatusCode::BAD_REQUEST,
					format!("Invalid port for {target}: {port}"),
				);
			},
		};
		if self.allowed.contains(&parsed) {
			next.run(cs, req).await
		} else {
			fail(
				StatusCode::FORBIDDEN,
				format!("Port not allowed for {target}: {parsed}"),
			)
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use proxy_core::copy::ConnectionStats;
	use proxy_core::strng;

	use super::*;
	use crate::http::filters::{FilterChain, FilterError, Terminal, Verdict};
	use crate::http::{Body, ConnectTarget, plain_response};
	use crate::transport::stream::ConnTracker;

	struct Ok200;
	#[async_trait]
	impl Terminal for Ok200 {
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

	fn connect(target: &str) -> Request {
		let mut req = ::http::Request::builder()
			.method(Method::CONNECT)
			.uri("http://placeholder/")
			.body(Body::empty())
			.unwrap();
		req
			.extensions_mut()
			.insert(ConnectTarget(strng::new(target)));
		req
	}

	async fn run(ports: Vec<u16>, req: Request) -> Result<Verdict, FilterError> {
		let chain = FilterChain::new(vec![Arc::new(RestrictConnectPorts::new(ports))]);
		chain.run(&state(), req, &Ok200).await
	}

	#[tokio::test]
	async fn allowed_port_continues() {
		let verdict = run(vec![443, 80], connect("site:443")).await.unwrap();
		assert!(matches!(verdict, Verdict::Respond(_)));
	}

	#[tokio::test]
	async fn missing_port_is_bad_request() {
		let err = run(vec![443], connect("site")).await.unwrap_err();
		assert_eq!(err.status, StatusCode::BAD_REQUEST);
		assert_eq!(err.description, "No port field in Request-URI / Host header");
	}

	#[tokio::test]
	async fn unparsable_port_is_bad_request() {
		let err = run(vec![443], connect("site:junk")).await.unwrap_err();
		assert_eq!(err.status, StatusCode::BAD_REQUEST);
		assert_eq!(err.description, "Invalid port for site:junk: junk");
	}

	#[tokio::test]
	async fn forbidden_port_is_403_with_the_exact_text() {
		let err = run(vec![443, 80], connect("site:9999")).await.unwrap_err();
		assert_eq!(err.status, StatusCode::FORBIDDEN);
		assert_eq!(err.description, "Port not allowed for site:9999: 9999");
	}

	#[tokio::test]
	async fn empty_allow_list_skips_the_check() {
		let verdict = run(vec![], connect("site:9999")).await.unwrap();
		assert!(matches!(verdict, Verdict::Respond(_)));
	}

	#[tokio::test]
	async fn non_connect_requests_pass() {
		let req = ::http::Request::builder()
			.uri("http://site:9999/")
			.body(Body::empty())
			.unwrap();
		let verdict = run(vec![443], req).await.unwrap();
		assert!(matches!(verdict, Verdict::Respond(_)));
	}
}
