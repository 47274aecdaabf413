use async_trait::async_trait;
use http::Method;

use crate::http::filters::{ConnectionState, Filter, FilterResult, Next};
use crate::http::{Request, x_headers};

/// Records the client address in `X-Forwarded-For` for non-CONNECT requests.
/// Values supplied by the client are only preserved when the operator has
/// opted into trusting an upstream proxy; otherwise the header is replaced
/// outright with the directly observed address.
pub struct AddForwardedFor {
	pub trust_forwarded: bool,
}

#[async_trait]
impl Filter for AddForwardedFor {
	async fn apply(&self, cs: &ConnectionState, mut req: Request, next: Next<'_>) -> FilterResult {
		if req.method() != Method::CONNECT {
			let client_ip = cs.peer_addr.ip().to_string();
			let prior: Vec<String> = if self.trust_forwarded {
				req
					.headers()
					.get_all(&x_headers::X_FORWARDED_FOR)
					.iter()
					.filter_map(|v| v.to_str().ok())
					.map(str::to_owned)
					.collect()
			} else {
				Vec::new()
			};
			let value = if prior.is_empty() {
				client_ip
			} else {
				format!("{}, {}", prior.join(", "), client_ip)
			};
			if let Ok(v) = value.parse() {
				req.headers_mut().insert(x_headers::X_FORWARDED_FOR.clone(), v);
			}
		}
		next.run(cs, req).await
	}
}
