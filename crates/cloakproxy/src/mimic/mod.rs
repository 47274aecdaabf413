//! Byte-compatible responses of an unconfigured Apache web server 2.4.7 (the
//! one installed by `apt-get install apache2`) running on Ubuntu 14.04, so
//! that probing cannot tell the proxy apart from a stock web server.

use std::sync::OnceLock;

use chrono::Utc;
use http::Method;
use minijinja::{Environment, context};
use once_cell::sync::Lazy;
use proxy_core::strng::Strng;
use rand::Rng;

const TIME_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

static HOST_PORT: OnceLock<(Strng, Strng)> = OnceLock::new();
static LAST_MODIFIED: Lazy<String> = Lazy::new(|| Utc::now().format(TIME_FORMAT).to_string());
static ETAG: Lazy<String> = Lazy::new(make_etag);

pub static INDEX_DOT_HTML: &[u8] = include_bytes!("assets/index.html");
pub static UBUNTU_LOGO: &[u8] = include_bytes!("assets/ubuntu-logo.png");

/// Set once when the listener address is known; the values appear in the
/// `Server at {host} Port {port}` address lines.
pub fn set_host_port(host: impl AsRef<str>, port: impl AsRef<str>) {
	let _ = HOST_PORT.set((
		proxy_core::strng::new(host.as_ref()),
		proxy_core::strng::new(port.as_ref()),
	));
}

fn host_port() -> &'static (Strng, Strng) {
	HOST_PORT.get_or_init(|| (proxy_core::strng::literal!("localhost"), proxy_core::strng::literal!("80")))
}

fn make_etag() -> String {
	const ALPHANUM: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
	let mut rng = rand::rng();
	let mut bytes = [0u8; 17];
	for b in bytes.iter_mut() {
		*b = ALPHANUM[rng.random_range(0..ALPHANUM.len())];
	}
	bytes[4] = b'-';
	String::from_utf8(bytes.to_vec()).expect("etag is ascii")
}

/// The set of methods Apache recognizes at all; anything else is 501.
pub const KNOWN_METHODS: &[&str] = &[
	"BASELINE-CONTROL",
	"CHECKIN",
	"CHECKOUT",
	"CONNECT",
	"COPY",
	"DELETE",
	"GET",
	"HEAD",
	"LABEL",
	"LOCK",
	"MERGE",
	"MKACTIVITY",
	"MKCOL",
	"MKWORKSPACE",
	"MOVE",
	"OPTIONS",
	"PATCH",
	"POLL",
	"POST",
	"PROPFIND",
	"PROPPATCH",
	"PUT",
	"REPORT",
	"TRACE",
	"UNCHECKOUT",
	"UNLOCK",
	"UPDATE",
	"VERSION-CONTROL",
];

/// Methods the default site actually serves; known methods outside this set
/// get 405.
pub const ALLOWED_METHODS: &[&str] = &["GET", "HEAD", "POST", "OPTIONS"];

static TEMPLATES: Lazy<Environment<'static>> = Lazy::new(|| {
	let mut env = Environment::new();
	let add = |env: &mut Environment<'static>, name, source| {
		env
			.add_template(name, source)
			.expect("static template must parse");
	};
	add(&mut env, "index_header", INDEX_HEADER);
	add(&mut env, "logo_header", LOGO_HEADER);
	add(&mut env, "not_found_header", NOT_FOUND_HEADER);
	add(
		&mut env,
		"not_found_header_when_head",
		NOT_FOUND_HEADER_WHEN_HEAD,
	);
	add(&mut env, "not_found_body", NOT_FOUND_BODY);
	add(&mut env, "bad_request_header", BAD_REQUEST_HEADER);
	add(&mut env, "bad_request_body", BAD_REQUEST_BODY);
	add(&mut env, "options_header", OPTIONS_HEADER);
	add(
		&mut env,
		"options_header_when_not_found",
		OPTIONS_HEADER_WHEN_NOT_FOUND,
	);
	add(&mut env, "options_header_of_logo", OPTIONS_HEADER_OF_LOGO);
	add(
		&mut env,
		"method_not_allowed_header",
		METHOD_NOT_ALLOWED_HEADER,
	);
	add(&mut env, "method_not_allowed_body", METHOD_NOT_ALLOWED_BODY);
	add(&mut env, "not_implemented_header", NOT_IMPLEMENTED_HEADER);
	add(&mut env, "not_implemented_body", NOT_IMPLEMENTED_BODY);
	env
});

fn render(name: &str, path: &str, content_length: usize) -> String {
	let (host, port) = host_port();
	TEMPLATES
		.get_template(name)
		.expect("template registered")
		.render(context! {
			date => Utc::now().format(TIME_FORMAT).to_string(),
			last_modified => LAST_MODIFIED.as_str(),
			etag => ETAG.as_str(),
			path => path,
			host => host.as_str(),
			port => port.as_str(),
			content_length => content_length,
		})
		.expect("static template must render")
}

// Header template paired with a canned byte body (the 200 responses).
fn ok(header: &str, path: &str, body: &[u8]) -> Vec<u8> {
	let mut out = render(header, path, 0).into_bytes();
	out.extend_from_slice(body);
	out
}

// Header template paired with a rendered body; Content-Length is computed
// from the rendered body, matching what Apache emits.
fn error(header: &str, body: Option<&str>, path: &str) -> Vec<u8> {
	let body = body.map(|b| render(b, path, 0));
	let content_length = body.as_deref().map(str::len).unwrap_or(0);
	let mut out = render(header, path, content_length).into_bytes();
	if let Some(body) = body {
		out.extend_from_slice(body.as_bytes());
	}
	out
}

/// Collapse duplicated leading slashes: `///x` matches the same resource as
/// `/x`.
pub fn normalize_path(path: &str) -> &str {
	let bytes = path.as_bytes();
	if bytes.first() != Some(&b'/') {
		return path;
	}
	let mut i = 1;
	while i < bytes.len() && bytes[i] == b'/' {
		i += 1;
	}
	&path[i - 1..]
}

/// The wire bytes for one parsed request, per the Apache decision table.
/// `host` is the effective Host header value, empty when absent.
pub fn respond(method: &Method, raw_path: &str, host: &str) -> Vec<u8> {
	let path = normalize_path(raw_path);
	if host.is_empty() {
		return error("bad_request_header", Some("bad_request_body"), path);
	}
	match method.as_str() {
		"CONNECT" => error("bad_request_header", Some("bad_request_body"), path),
		"GET" | "POST" => match path {
			"/" | "/index.html" => ok("index_header", path, INDEX_DOT_HTML),
			"/icons/ubuntu-logo.png" => ok("logo_header", path, UBUNTU_LOGO),
			_ => error("not_found_header", Some("not_found_body"), path),
		},
		"HEAD" => match path {
			"/" | "/index.html" => ok("index_header", path, b""),
			"/icons/ubuntu-logo.png" => ok("logo_header", path, b""),
			_ => error("not_found_header_when_head", None, path),
		},
		"OPTIONS" => match path {
			"/" | "/index.html" => error("options_header", None, path),
			"/icons/ubuntu-logo.png" => error("options_header_of_logo", None, path),
			_ => error("options_header_when_not_found", None, path),
		},
		m => {
			let path = if path == "/" { "/index.html" } else { path };
			if !KNOWN_METHODS.contains(&m) {
				error("not_implemented_header", Some("not_implemented_body"), path)
			} else {
				error(
					"method_not_allowed_header",
					Some("method_not_allowed_body"),
					path,
				)
			}
		},
	}
}

/// The wire bytes for input that never parsed into a request at all.
pub fn respond_invalid() -> Vec<u8> {
	error("bad_request_header", Some("bad_request_body"), "/")
}

const INDEX_HEADER: &str = "HTTP/1.1 200 OK\r\n\
Date: {{ date }}\r\n\
Server: Apache/2.4.7 (Ubuntu)\r\n\
Last-Modified: {{ last_modified }}\r\n\
ETag: \"{{ etag }}\"\r\n\
Accept-Ranges: bytes\r\n\
Content-Length: 11510\r\n\
Vary: Accept-Encoding\r\n\
Content-Type: text/html\r\n\r\n";

const LOGO_HEADER: &str = "HTTP/1.1 200 OK\r\n\
Date: {{ date }}\r\n\
Server: Apache/2.4.7 (Ubuntu)\r\n\
Last-Modified: {{ last_modified }}\r\n\
ETag: \"{{ etag }}\"\r\n\
Accept-Ranges: bytes\r\n\
Content-Length: 3404\r\n\
Content-Type: image/png\r\n\r\n";

const NOT_FOUND_HEADER: &str = "HTTP/1.1 404 Not Found\r\n\
Date: {{ date }}\r\n\
Server: Apache/2.4.7 (Ubuntu)\r\n\
Content-Length: {{ content_length }}\r\n\
Content-Type: text/html; charset=iso-8859-1\r\n\r\n";

const NOT_FOUND_HEADER_WHEN_HEAD: &str = "HTTP/1.1 404 Not Found\r\n\
Date: {{ date }}\r\n\
Server: Apache/2.4.7 (Ubuntu)\r\n\
Content-Type: text/html; charset=iso-8859-1\r\n\r\n";

const NOT_FOUND_BODY: &str = r#"<!DOCTYPE HTML PUBLIC "-//IETF//DTD HTML 2.0//EN">
<html><head>
<title>404 Not Found</title>
</head><body>
<h1>Not Found</h1>
<p>The requested URL {{ path }} was not found on this server.</p>
<hr>
<address>Apache/2.4.7 (Ubuntu) Server at {{ host }} Port {{ port }}</address>
</body></html>
"#;

const BAD_REQUEST_HEADER: &str = "HTTP/1.1 400 Bad Request\r\n\
Date: {{ date }}\r\n\
Server: Apache/2.4.7 (Ubuntu)\r\n\
Content-Length: {{ content_length }}\r\n\
Connection: close\r\n\
Content-Type: text/html; charset=iso-8859-1\r\n\r\n";

const BAD_REQUEST_BODY: &str = r#"<!DOCTYPE HTML PUBLIC "-//IETF//DTD HTML 2.0//EN">
<html><head>
<title>400 Bad Request</title>
</head><body>
<h1>Bad Request</h1>
<p>Your browser sent a request that this server could not understand.<br />
</p>
<hr>
<address>Apache/2.4.7 (Ubuntu) Server at {{ host }} Port {{ port }}</address>
</body></html>
"#;

const OPTIONS_HEADER: &str = "HTTP/1.1 200 OK\r\n\
Date: {{ date }}\r\n\
Server: Apache/2.4.7 (Ubuntu)\r\n\
Allow: GET,HEAD,POST,OPTIONS\r\n\
Content-Length: {{ content_length }}\r\n\
Content-Type: text/html\r\n\r\n";

const OPTIONS_HEADER_WHEN_NOT_FOUND: &str = "HTTP/1.1 200 OK\r\n\
Date: {{ date }}\r\n\
Server: Apache/2.4.7 (Ubuntu)\r\n\
Allow: GET,HEAD,POST,OPTIONS\r\n\
Content-Length: {{ content_length }}\r\n\r\n";

const OPTIONS_HEADER_OF_LOGO: &str = "HTTP/1.1 200 OK\r\n\
Date: {{ date }}\r\n\
Server: Apache/2.4.7 (Ubuntu)\r\n\
Allow: GET,HEAD,POST,OPTIONS\r\n\
Content-Length: {{ content_length }}\r\n\
Content-Type: image/png\r\n\r\n";

const METHOD_NOT_ALLOWED_HEADER: &str = "HTTP/1.1 405 Method Not Allowed\r\n\
Date: {{ date }}\r\n\
Server: Apache/2.4.7 (Ubuntu)\r\n\
Allow: GET,HEAD,POST,OPTIONS\r\n\
Content-Length: {{ content_length }}\r\n\
Content-Type: text/html; charset=iso-8859-1\r\n\r\n";

const METHOD_NOT_ALLOWED_BODY: &str = r#"<!DOCTYPE HTML PUBLIC "-//IETF//DTD HTML 2.0//EN">
<html><head>
<title>405 Method Not Allowed</title>
</head><body>
<h1>Method Not Allowed</h1>
<p>The requested method PUT is not allowed for the URL {{ path }}.</p>
<hr>
<address>Apache/2.4.7 (Ubuntu) Server at {{ host }} Port {{ port }}</address>
</body></html>
"#;

const NOT_IMPLEMENTED_HEADER: &str = "HTTP/1.1 501 Not Implemented\r\n\
Date: {{ date }}\r\n\
Server: Apache/2.4.7 (Ubuntu)\r\n\
Allow: GET,HEAD,POST,OPTIONS\r\n\
Content-Length: {{ content_length }}\r\n\
Connection: close\r\n\
Content-Type: text/html; charset=iso-8859-1\r\n\r\n";

const NOT_IMPLEMENTED_BODY: &str = r#"<!DOCTYPE HTML PUBLIC "-//IETF//DTD HTML 2.0//EN">
<html><head>
<title>501 Not Implemented</title>
</head><body>
<h1>Not Implemented</h1>
<p>INVALID to {{ path }} not supported.<br />
</p>
<hr>
<address>Apache/2.4.7 (Ubuntu) Server at {{ host }} Port {{ port }}</address>
</body></html>
"#;

#[cfg(test)]
mod tests {
	use super::*;

	// Replace the volatile header fields with fixed markers so responses can
	// be compared byte-for-byte, the same masking a recorded-capture diff
	// would apply.
	fn mask(resp: &[u8]) -> String {
		let text = String::from_utf8_lossy(resp).into_owned();
		let mut out = String::new();
		for line in text.split_inclusive("\r\n") {
			if line.starts_with("Date: ") || line.starts_with("Last-Modified: ") {
				out.push_str(line.split_once(':').unwrap().0);
				out.push_str(": MASKED\r\n");
			} else if line.starts_with("ETag: ") {
				out.push_str("ETag: MASKED\r\n");
			} else {
				out.push_str(line);
			}
		}
		out
	}

	fn status_line(resp: &[u8]) -> String {
		String::from_utf8_lossy(resp)
			.split("\r\n")
			.next()
			.unwrap()
			.to_string()
	}

	#[test]
	fn index_paths_serve_canned_page() {
		for path in ["/", "/index.html", "///index.html"] {
			let resp = respond(&Method::GET, path, "example.com");
			assert_eq!(status_line(&resp), "HTTP/1.1 200 OK", "path {path}");
			assert!(resp.ends_with(INDEX_DOT_HTML));
			let text = String::from_utf8_lossy(&resp);
			assert!(text.contains("Content-Length: 11510\r\n"));
			assert!(text.contains("Server: Apache/2.4.7 (Ubuntu)\r\n"));
		}
		assert_eq!(INDEX_DOT_HTML.len(), 11510);
	}

	#[test]
	fn logo_serves_png() {
		let resp = respond(&Method::GET, "/icons/ubuntu-logo.png", "example.com");
		assert_eq!(status_line(&resp), "HTTP/1.1 200 OK");
		assert!(resp.ends_with(UBUNTU_LOGO));
		assert!(String::from_utf8_lossy(&resp).contains("Content-Type: image/png\r\n"));
		assert_eq!(UBUNTU_LOGO.len(), 3404);
		assert_eq!(&UBUNTU_LOGO[..8], b"\x89PNG\r\n\x1a\n");
	}

	#[test]
	fn unknown_path_is_404_naming_the_path() {
		let resp = respond(&Method::GET, "/not-existed", "example.com");
		assert_eq!(status_line(&resp), "HTTP/1.1 404 Not Found");
		let text = String::from_utf8_lossy(&resp);
		assert!(text.contains("<p>The requested URL /not-existed was not found on this server.</p>"));
		// Advertised length matches the rendered body.
		let (head, body) = split_head(&resp);
		let cl = content_length(head).unwrap();
		assert_eq!(cl, body.len());
	}

	#[test]
	fn head_matches_get_headers_without_body() {
		let get = respond(&Method::GET, "/index.html", "example.com");
		let head = respond(&Method::HEAD, "/index.html", "example.com");
		let (get_head, _) = split_head(&get);
		let (head_head, head_body) = split_head(&head);
		assert_eq!(mask_str(get_head), mask_str(head_head));
		assert!(head_body.is_empty());
	}

	#[test]
	fn head_of_unknown_path_has_no_content_length() {
		let resp = respond(&Method::HEAD, "/nope", "example.com");
		assert_eq!(status_line(&resp), "HTTP/1.1 404 Not Found");
		let (head, body) = split_head(&resp);
		assert!(!head.contains("Content-Length"));
		assert!(body.is_empty());
	}

	#[test]
	fn options_allows_the_default_site_methods() {
		let resp = respond(&Method::OPTIONS, "/", "example.com");
		let (head, body) = split_head(&resp);
		assert!(head.contains("Allow: GET,HEAD,POST,OPTIONS\r\n"));
		assert!(head.contains("Content-Length: 0\r\n"));
		assert!(head.contains("Content-Type: text/html\r\n"));
		assert!(body.is_empty());

		let logo = respond(&Method::OPTIONS, "/icons/ubuntu-logo.png", "example.com");
		assert!(split_head(&logo).0.contains("Content-Type: image/png\r\n"));

		// Unknown paths keep the Allow line but drop the content type.
		let other = respond(&Method::OPTIONS, "/cgi-bin/php", "example.com");
		let (head, _) = split_head(&other);
		assert!(head.contains("Allow: GET,HEAD,POST,OPTIONS\r\n"));
		assert!(!head.contains("Content-Type"));
	}

	#[test]
	fn connect_and_missing_host_get_400() {
		let resp = respond(&Method::CONNECT, "", "example.com");
		assert_eq!(status_line(&resp), "HTTP/1.1 400 Bad Request");
		let resp = respond(&Method::GET, "/", "");
		assert_eq!(status_line(&resp), "HTTP/1.1 400 Bad Request");
		assert!(String::from_utf8_lossy(&resp).contains("Connection: close\r\n"));
	}

	#[test]
	fn unknown_method_is_501() {
		let method = Method::from_bytes(b"FROBNICATE").unwrap();
		let resp = respond(&method, "/", "example.com");
		assert_eq!(status_line(&resp), "HTTP/1.1 501 Not Implemented");
		// The quirky body names /index.html for the root path.
		assert!(String::from_utf8_lossy(&resp).contains("INVALID to /index.html not supported."));
	}

	#[test]
	fn known_but_disallowed_method_is_405() {
		for m in ["PUT", "DELETE", "PROPFIND", "POLL"] {
			let method = Method::from_bytes(m.as_bytes()).unwrap();
			let resp = respond(&method, "/x", "example.com");
			assert_eq!(status_line(&resp), "HTTP/1.1 405 Method Not Allowed", "{m}");
		}
	}

	#[test]
	fn invalid_input_is_full_400() {
		let resp = respond_invalid();
		assert_eq!(status_line(&resp), "HTTP/1.1 400 Bad Request");
		let (head, body) = split_head(&resp);
		assert_eq!(content_length(head).unwrap(), body.len());
		assert!(String::from_utf8_lossy(&resp).contains("<title>400 Bad Request</title>"));
	}

	#[test]
	fn etag_shape() {
		assert_eq!(ETAG.len(), 17);
		assert_eq!(ETAG.as_bytes()[4], b'-');
		assert!(
			ETAG
				.bytes()
				.enumerate()
				.all(|(i, b)| i == 4 || b.is_ascii_lowercase() || b.is_ascii_digit())
		);
	}

	#[test]
	fn leading_slash_normalization() {
		assert_eq!(normalize_path("///x"), "/x");
		assert_eq!(normalize_path("//cgi-bin/php"), "/cgi-bin/php");
		assert_eq!(normalize_path("/"), "/");
		assert_eq!(normalize_path(""), "");
	}

	#[test]
	fn masked_responses_are_stable() {
		let a = mask(&respond(&Method::GET, "/not-existed", "example.com"));
		let b = mask(&respond(&Method::GET, "/not-existed", "example.com"));
		assert_eq!(a, b);
	}

	fn split_head(resp: &[u8]) -> (&str, &[u8]) {
		let pos = resp
			.windows(4)
			.position(|w| w == b"\r\n\r\n")
			.expect("full head");
		(
			std::str::from_utf8(&resp[..pos + 4]).unwrap(),
			&resp[pos + 4..],
		)
	}

	fn content_length(head: &str) -> Option<usize> {
		head
			.lines()
			.find_map(|l| l.strip_prefix("Content-Length: "))
			.map(|v| v.trim().parse().unwrap())
	}

	fn mask_str(head: &str) -> String {
		mask(head.as_bytes())
	}
}
