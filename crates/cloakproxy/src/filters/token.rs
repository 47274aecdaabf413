use async_trait::async_trait;
use proxy_core::strng::Strng;
use tracing::debug;

use crate::filters::mimic_for_request;
use crate::http::filters::{ConnectionState, Filter, FilterResult, Next, Verdict};
use crate::http::{Request, x_headers};

/// Compares `X-Lantern-Auth-Token` against the configured value. A mismatch
/// is answered by the Apache mimic, indistinguishable from a 404 on a stock
/// server; a match strips the header and continues.
pub struct TokenFilter {
	token: Strng,
}

impl TokenFilter {
	pub fn new(token: Strng) -> TokenFilter {
		TokenFilter { token }
	}
}

#[async_trait]
impl Filter for TokenFilter {
	async fn apply(&self, cs: &ConnectionState, mut req: Request, next: Next<'_>) -> FilterResult {
		let provided = req
			.headers()
			.get(&x_headers::X_LANTERN_AUTH_TOKEN)
			.and_then(|v| v.to_str().ok())
			.unwrap_or("");
		if !self.token.is_empty() && provided != self.token.as_str() {
			debug!(peer = %cs.peer_addr, "auth token mismatch, mimicking apache");
			return Ok(Verdict::Mimic(mimic_for_request(&req)));
		}
		req.headers_mut().remove(&x_headers::X_LANTERN_AUTH_TOKEN);
		next.run(cs, req).await
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use http::StatusCode;
	use parking_lot::Mutex;
	use proxy_core::copy::ConnectionStats;

	use super::*;
	use crate::http::filters::{FilterChain, Terminal};
	use crate::http::{Body, plain_response};
	use crate::transport::stream::ConnTracker;

	struct CaptureToken(Mutex<Option<String>>);
	#[async_trait]
	impl Terminal for CaptureToken {
		async fn dispatch(&self, _cs: &ConnectionState, req: Request) -> FilterResult {
			*self.0.lock() = req
				.headers()
				.get(&x_headers::X_LANTERN_AUTH_TOKEN)
				.and_then(|v| v.to_str().ok())
				.map(str::to_owned);
			Ok(Verdict::Respond(plain_response(StatusCode::OK, "reached")))
		}
	}

	fn state() -> ConnectionState {
		ConnectionState::new(
			"127.0.0.1:5000".parse().unwrap(),
			ConnTracker::new(ConnectionStats::new()),
		)
	}

	fn get(token: Option<&str>) -> Request {
		let mut b = ::http::Request::builder().uri("http://origin.test/secret");
		if let Some(t) = token {
			b = b.header(&x_headers::X_LANTERN_AUTH_TOKEN, t);
		}
		b.header("host", "origin.test").body(Body::empty()).unwrap()
	}

	async fn run(configured: &str, req: Request) -> (Verdict, Option<String>) {
		let capture = CaptureToken(Mutex::new(None));
		let chain = FilterChain::new(vec![Arc::new(TokenFilter::new(configured.into()))]);
		let verdict = chain.run(&state(), req, &capture).await.unwrap();
		let seen = capture.0.lock().clone();
		(verdict, seen)
	}

	#[tokio::test]
	async fn matching_token_continues_with_header_stripped() {
		let (verdict, seen) = run("GOODTOKEN", get(Some("GOODTOKEN"))).await;
		assert!(matches!(verdict, Verdict::Respond(_)));
		assert_eq!(seen, None);
	}

	#[tokio::test]
	async fn bad_token_gets_apache_bytes() {
		let (verdict, _) = run("GOODTOKEN", get(Some("BAD"))).await;
		let Verdict::Mimic(bytes) = verdict else {
			panic!("expected mimicry");
		};
		let text = String::from_utf8_lossy(&bytes);
		// The path does not exist on a stock Apache, so the probe sees 404.
		assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
		assert!(text.contains("Server: Apache/2.4.7 (Ubuntu)"));
	}

	#[tokio::test]
	async fn missing_token_gets_apache_bytes() {
		let (verdict, _) = run("GOODTOKEN", get(None)).await;
		assert!(matches!(verdict, Verdict::Mimic(_)));
	}

	#[tokio::test]
	async fn empty_configured_token_disables_the_check() {
		let (verdict, seen) = run("", get(Some("whatever"))).await;
		assert!(matches!(verdict, Verdict::Respond(_)));
		// The recognized header never travels upstream.
		assert_eq!(seen, None);
	}
}
