use async_trait::async_trait;
use http::Method;
use tracing::{Instrument, debug, error, info_span};

use crate::http::Request;
use crate::http::filters::{ConnectionState, Filter, FilterResult, Next};
use crate::proxy::is_benign_net_error;

/// Wraps the rest of the chain in a `proxy_http` / `proxy_https` operation
/// span and logs failures. Network timeouts and DNS failures are demoted to
/// debug; they are outside our control and would flood the logs.
pub struct RecordOp;

#[async_trait]
impl Filter for RecordOp {
	async fn apply(&self, cs: &ConnectionState, req: Request, next: Next<'_>) -> FilterResult {
		let span = if req.method() == Method::CONNECT {
			info_span!("proxy_https")
		} else {
			info_span!("proxy_http")
		};
		async move {
			let res = next.run(cs, req).await;
			if let Err(e) = &res {
				if is_benign_net_error(e) {
					debug!(status = %e.status, "proxy operation failed: {e}");
				} else {
					error!(status = %e.status, "proxy operation failed: {e}");
				}
			}
			res
		}
		.instrument(span)
		.await
	}
}
