pub mod filters;

pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub use ::http::uri::Authority;
pub use ::http::{
	HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version, header, uri,
};

/// Request headers recognized by the proxy itself. All of these are consumed
/// before anything is forwarded upstream.
pub mod x_headers {
	use http::HeaderName;

	pub const X_LANTERN_AUTH_TOKEN: HeaderName = HeaderName::from_static("x-lantern-auth-token");
	pub const X_LANTERN_DEVICE_ID: HeaderName = HeaderName::from_static("x-lantern-device-id");
	pub const X_LANTERN_PERSISTENT: HeaderName = HeaderName::from_static("x-lantern-persistent");
	pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
}

/// The raw `host:port` target of a CONNECT request, kept verbatim so policy
/// filters can report it exactly as the client sent it (the parsed URI would
/// reject targets like `site:notaport`).
#[derive(Debug, Clone)]
pub struct ConnectTarget(pub proxy_core::strng::Strng);

/// The authority a request is aimed at: the CONNECT target, the absolute-URI
/// authority, or the Host header, in that order.
pub fn request_authority(req: &Request) -> Option<proxy_core::strng::Strng> {
	if let Some(ConnectTarget(t)) = req.extensions().get::<ConnectTarget>() {
		return Some(t.clone());
	}
	if let Some(a) = req.uri().authority() {
		return Some(proxy_core::strng::new(a.as_str()));
	}
	req
		.headers()
		.get(header::HOST)
		.and_then(|v| v.to_str().ok())
		.map(proxy_core::strng::new)
}

/// The target host without any port.
pub fn request_host(req: &Request) -> Option<proxy_core::strng::Strng> {
	request_authority(req).map(|a| proxy_core::strng::new(split_host_port(&a).0))
}

/// Hop-by-hop headers are only meaningful on a single link and must not be
/// forwarded (RFC 2616 section 13.5.1).
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
	matches!(
		name.as_str(),
		"connection"
			| "keep-alive"
			| "proxy-authenticate"
			| "proxy-authorization"
			| "te"
			| "trailer"
			| "trailers"
			| "transfer-encoding"
			| "upgrade"
	)
}

/// Header names listed in the inbound `Connection` header are hop-by-hop for
/// this link as well (RFC 2616 section 14.10).
pub fn connection_named_headers(headers: &HeaderMap) -> Vec<String> {
	headers
		.get_all(header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.map(|t| t.trim().to_ascii_lowercase())
		.filter(|t| !t.is_empty())
		.collect()
}

/// Split `host[:port]`, tolerating bracketed IPv6 literals. Returns the host
/// part and the port part, if any.
pub fn split_host_port(hostport: &str) -> (&str, Option<&str>) {
	if let Some(rest) = hostport.strip_prefix('[') {
		// [v6]:port or [v6]
		if let Some(end) = rest.find(']') {
			let host = &rest[..end];
			let after = &rest[end + 1..];
			return match after.strip_prefix(':') {
				Some(p) => (host, Some(p)),
				None => (host, None),
			};
		}
		return (hostport, None);
	}
	match hostport.rfind(':') {
		// More than one colon with no brackets is a bare IPv6 address.
		Some(i) if hostport[..i].contains(':') => (hostport, None),
		Some(i) => (&hostport[..i], Some(&hostport[i + 1..])),
		None => (hostport, None),
	}
}

/// A plain-text response carrying the given status and message, the shape
/// used for policy denials and upstream failures.
pub fn plain_response(status: StatusCode, msg: impl Into<String>) -> Response {
	let msg = msg.into();
	::http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Body::from(msg))
		.expect("static response must build")
}
