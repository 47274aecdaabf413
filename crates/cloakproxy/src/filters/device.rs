use async_trait::async_trait;
use proxy_core::strng;
use tracing::debug;

use crate::filters::mimic_for_request;
use crate::http::filters::{ConnectionState, Filter, FilterResult, Next, Verdict};
use crate::http::{Request, x_headers};

/// Requires `X-Lantern-Device-Id` and records it in the connection tag map
/// under `client`, where the metering callback picks it up. Requests without
/// a device id are answered by the Apache mimic.
pub struct DeviceFilter;

#[async_trait]
impl Filter for DeviceFilter {
	async fn apply(&self, cs: &ConnectionState, mut req: Request, next: Next<'_>) -> FilterResult {
		let device_id = req
			.headers()
			.get(&x_headers::X_LANTERN_DEVICE_ID)
			.and_then(|v| v.to_str().ok())
			.unwrap_or("");
		if device_id.is_empty() {
			debug!(peer = %cs.peer_addr, "no device id header, mimicking apache");
			return Ok(Verdict::Mimic(mimic_for_request(&req)));
		}
		cs.tracker
			.set_tag(strng::literal!("client"), strng::new(device_id));
		req.headers_mut().remove(&x_headers::X_LANTERN_DEVICE_ID);
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

	struct CaptureHeader(Mutex<Option<String>>);
	#[async_trait]
	impl Terminal for CaptureHeader {
		async fn dispatch(&self, _cs: &ConnectionState, req: Request) -> FilterResult {
			*self.0.lock() = req
				.headers()
				.get(&x_headers::X_LANTERN_DEVICE_ID)
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

	#[tokio::test]
	async fn device_id_is_tagged_and_stripped() {
		let cs = state();
		let capture = CaptureHeader(Mutex::new(None));
		let chain = FilterChain::new(vec![Arc::new(DeviceFilter)]);
		let req = ::http::Request::builder()
			.uri("http://origin.test/")
			.header(&x_headers::X_LANTERN_DEVICE_ID, "DEV1")
			.body(Body::empty())
			.unwrap();
		let verdict = chain.run(&cs, req, &capture).await.unwrap();
		assert!(matches!(verdict, Verdict::Respond(_)));
		assert_eq!(cs.tracker.tag("client").as_deref(), Some("DEV1"));
		assert_eq!(*capture.0.lock(), None);
	}

	#[tokio::test]
	async fn missing_device_id_gets_apache_bytes() {
		let cs = state();
		let capture = CaptureHeader(Mutex::new(None));
		let chain = FilterChain::new(vec![Arc::new(DeviceFilter)]);
		let req = ::http::Request::builder()
			.uri("http://origin.test/")
			.header("host", "origin.test")
			.body(Body::empty())
			.unwrap();
		let verdict = chain.run(&cs, req, &capture).await.unwrap();
		let Verdict::Mimic(bytes) = verdict else {
			panic!("expected mimicry");
		};
		assert!(
			String::from_utf8_lossy(&bytes).contains("Server: Apache/2.4.7 (Ubuntu)")
		);
		assert!(cs.tracker.tag("client").is_none());
	}
}
