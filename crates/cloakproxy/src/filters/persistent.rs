use async_trait::async_trait;
use proxy_core::strng;
use tracing::debug;

use crate::http::filters::{ConnectionState, Filter, FilterResult, Next, Verdict};
use crate::http::{Request, request_authority, split_host_port, x_headers};

/// The first request of a persistent HTTP session is a sentinel carrying
/// `X-Lantern-Persistent: true`; it is consumed without a response, and its
/// target pins the upstream for every later request on this connection.
pub struct DiscardInitialPersistentRequest;

fn is_truthy(v: &str) -> bool {
	matches!(v.trim(), "1" | "t" | "T" | "true" | "TRUE" | "True")
}

#[async_trait]
impl Filter for DiscardInitialPersistentRequest {
	async fn apply(&self, cs: &ConnectionState, req: Request, next: Next<'_>) -> FilterResult {
		let persistent = req
			.headers()
			.get(&x_headers::X_LANTERN_PERSISTENT)
			.and_then(|v| v.to_str().ok())
			.map(is_truthy)
			.unwrap_or(false);
		if !persistent {
			return next.run(cs, req).await;
		}
		if let Some(authority) = request_authority(&req) {
			let target = match split_host_port(&authority) {
				(_, Some(_)) => authority,
				(host, None) => strng::format!("{host}:80"),
			};
			debug!(dst = target.as_str(), "persistent session handshake");
			*cs.pinned_target.lock() = Some(target);
		}
		Ok(Verdict::Discard)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use http::StatusCode;
	use proxy_core::copy::ConnectionStats;

	use super::*;
	use crate::http::filters::{FilterChain, Terminal, Verdict};
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

	fn sentinel(url: &str) -> Request {
		::http::Request::builder()
			.uri(url)
			.header(&x_headers::X_LANTERN_PERSISTENT, "true")
			.body(Body::empty())
			.unwrap()
	}

	#[tokio::test]
	async fn sentinel_is_discarded_and_pins_the_target() {
		let cs = state();
		let chain = FilterChain::new(vec![Arc::new(DiscardInitialPersistentRequest)]);
		let verdict = chain
			.run(&cs, sentinel("http://origin.test:8080/"), &Reached)
			.await
			.unwrap();
		assert!(matches!(verdict, Verdict::Discard));
		assert_eq!(
			cs.pinned_target.lock().as_deref(),
			Some("origin.test:8080")
		);
	}

	#[tokio::test]
	async fn default_port_is_80() {
		let cs = state();
		let chain = FilterChain::new(vec![Arc::new(DiscardInitialPersistentRequest)]);
		chain
			.run(&cs, sentinel("http://origin.test/"), &Reached)
			.await
			.unwrap();
		assert_eq!(cs.pinned_target.lock().as_deref(), Some("origin.test:80"));
	}

	#[tokio::test]
	async fn ordinary_requests_continue() {
		let cs = state();
		let chain = FilterChain::new(vec![Arc::new(DiscardInitialPersistentRequest)]);
		let req = ::http::Request::builder()
			.uri("http://origin.test/")
			.body(Body::empty())
			.unwrap();
		let verdict = chain.run(&cs, req, &Reached).await.unwrap();
		assert!(matches!(verdict, Verdict::Respond(_)));
		assert!(cs.pinned_target.lock().is_none());
	}
}
