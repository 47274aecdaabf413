//! The proxy's built-in filters. Composition order matters; see
//! [`build_chain`] for the canonical arrangement.

mod block_local;
mod connect_ports;
mod device;
mod forwarded_for;
mod persistent;
mod ratelimit;
mod record_op;
mod token;

use std::sync::Arc;

pub use block_local::BlockLocal;
pub use connect_ports::RestrictConnectPorts;
pub use device::DeviceFilter;
pub use forwarded_for::AddForwardedFor;
pub use persistent::DiscardInitialPersistentRequest;
pub use ratelimit::RateLimit;
pub use record_op::RecordOp;
pub use token::TokenFilter;

use crate::config::Config;
use crate::http::filters::{Filter, FilterChain};
use crate::http::{Request, header};
use crate::mimic;

/// Render the Apache-mimic bytes for a request that failed authentication or
/// asked for something the "web server" does not have.
pub(crate) fn mimic_for_request(req: &Request) -> Vec<u8> {
	let host = req
		.headers()
		.get(header::HOST)
		.and_then(|v| v.to_str().ok())
		.map(str::to_owned)
		.or_else(|| req.uri().host().map(str::to_owned))
		.unwrap_or_default();
	mimic::respond(req.method(), req.uri().path(), &host)
}

/// The canonical chain: discard the persistent handshake first (it must never
/// reach auth or policy), then client labeling, then auth, then policy.
pub fn build_chain(cfg: &Config) -> FilterChain {
	let mut filters: Vec<Arc<dyn Filter>> = vec![
		Arc::new(DiscardInitialPersistentRequest),
		Arc::new(AddForwardedFor {
			trust_forwarded: cfg.trust_forwarded,
		}),
		Arc::new(RecordOp),
	];
	if let Some(token) = &cfg.token {
		filters.push(Arc::new(TokenFilter::new(token.clone())));
	}
	if cfg.enable_device_filter {
		filters.push(Arc::new(DeviceFilter));
	}
	filters.push(Arc::new(BlockLocal::new(
		cfg.block_local_exceptions.clone(),
	)));
	filters.push(Arc::new(RestrictConnectPorts::new(
		cfg.allowed_connect_ports.clone(),
	)));
	if !cfg.rate_limits.is_empty() {
		filters.push(Arc::new(RateLimit::new(
			cfg.rate_limit_clients,
			cfg.rate_limits.clone(),
		)));
	}
	FilterChain::new(filters)
}
