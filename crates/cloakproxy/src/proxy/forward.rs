use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use proxy_core::strng;
use proxy_core::strng::Strng;
use tracing::{debug, trace};

use crate::http::filters::{ConnectionState, FilterError, FilterResult, Verdict};
use crate::http::{
	Body, Request, Response, connection_named_headers, header, is_hop_by_hop, request_authority,
	split_host_port,
};
use crate::proxy::status_for_io;
use crate::transport::stream::Socket;

/// One reused upstream leg: a dedicated HTTP/1.1 client connection paired
/// with this downstream connection. Requests go out in arrival order and
/// responses come back in the same order; the connection gives that for free.
pub struct UpstreamSession {
	target: Strng,
	sender: http1::SendRequest<Body>,
}

pub type ResponseTransform = Arc<dyn Fn(Response) -> Response + Send + Sync>;

/// The HTTP forwarding engine. One upstream TCP connection is kept per client
/// connection and reused while the target stays the same, amortizing setup
/// across the session. Activated for every plain (non-CONNECT) proxied
/// request; the persistent handshake merely pins the target up front.
pub struct Forwarder {
	pub dial_timeout: Duration,
	pub idle_timeout: Duration,
	pub response_transform: Option<ResponseTransform>,
}

impl Forwarder {
	pub async fn forward(&self, cs: &ConnectionState, req: Request) -> FilterResult {
		let pinned = cs.pinned_target.lock().clone();
		let target = match pinned {
			Some(t) => t,
			None => {
				let authority = request_authority(&req).ok_or_else(|| {
					FilterError::new(StatusCode::BAD_REQUEST, "request has no target host")
				})?;
				match split_host_port(&authority) {
					(_, Some(_)) => authority,
					(host, None) => strng::format!("{host}:80"),
				}
			},
		};
		let out = rewrite_request(req)?;

		let mut slot = cs.upstream.lock().await;
		let reusable = match slot.as_mut() {
			Some(s) if s.target == target => s.sender.ready().await.is_ok(),
			_ => false,
		};
		if !reusable {
			let socket = Socket::dial(&target, self.dial_timeout)
				.await
				.map_err(|e| {
					FilterError::new(status_for_io(&e), format!("Unable to dial {target}: {e}"))
						.with_source(e.into())
				})?
				.with_idle_timeout(self.idle_timeout);
			let (sender, conn) = http1::handshake(TokioIo::new(socket)).await.map_err(|e| {
				FilterError::new(
					StatusCode::BAD_GATEWAY,
					format!("Unable to establish HTTP session with {target}: {e}"),
				)
				.with_source(e.into())
			})?;
			let conn_target = target.clone();
			tokio::spawn(async move {
				// Idled-out and closed-by-peer endings are routine pool churn.
				if let Err(e) = conn.await {
					trace!(dst = conn_target.as_str(), "upstream connection ended: {e}");
				}
			});
			trace!(dst = target.as_str(), "dialed upstream");
			*slot = Some(UpstreamSession {
				target: target.clone(),
				sender,
			});
		}

		let result = slot
			.as_mut()
			.expect("session was just ensured")
			.sender
			.send_request(out)
			.await;
		let resp = match result {
			Ok(resp) => resp,
			Err(e) => {
				// The session is unusable; the client must reopen to resume.
				*slot = None;
				let status = if e.is_timeout() {
					StatusCode::GATEWAY_TIMEOUT
				} else {
					StatusCode::BAD_GATEWAY
				};
				return Err(
					FilterError::new(status, format!("Error sending request to {target}: {e}"))
						.with_source(e.into()),
				);
			},
		};
		debug!(dst = target.as_str(), status = %resp.status(), "forwarded request");

		let resp = resp.map(Body::new);
		let (mut parts, body) = resp.into_parts();
		let named = connection_named_headers(&parts.headers);
		let stripped: Vec<_> = parts
			.headers
			.keys()
			.filter(|name| is_hop_by_hop(name) || named.iter().any(|n| n == name.as_str()))
			.cloned()
			.collect();
		for name in stripped {
			parts.headers.remove(&name);
		}
		let mut resp = Response::from_parts(parts, body);
		if let Some(transform) = &self.response_transform {
			resp = transform(resp);
		}
		Ok(Verdict::Respond(resp))
	}
}

/// Clone an inbound request for the origin: HTTP/1.1, keep-alive, origin-form
/// URI with the raw query preserved, Host from the original target, and all
/// hop-by-hop headers dropped, including those named by the inbound
/// `Connection` header (RFC 2616 section 14.10).
fn rewrite_request(req: Request) -> Result<http::Request<Body>, FilterError> {
	let host_header = request_authority(&req)
		.ok_or_else(|| FilterError::new(StatusCode::BAD_REQUEST, "request has no target host"))?;
	let (parts, body) = req.into_parts();

	let path_and_query = parts
		.uri
		.path_and_query()
		.map(|pq| pq.as_str())
		.filter(|s| !s.is_empty())
		.unwrap_or("/");
	let uri: http::Uri = path_and_query
		.parse()
		.map_err(|_| FilterError::new(StatusCode::BAD_REQUEST, "request target is not a path"))?;

	let named = connection_named_headers(&parts.headers);
	let mut builder = ::http::Request::builder()
		.method(parts.method)
		.uri(uri)
		.version(http::Version::HTTP_11);
	for (name, value) in &parts.headers {
		if is_hop_by_hop(name) || named.iter().any(|n| n == name.as_str()) || name == header::HOST {
			continue;
		}
		builder = builder.header(name, value);
	}
	builder = builder.header(header::HOST, host_header.as_str());
	builder
		.body(body)
		.map_err(|e| FilterError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
