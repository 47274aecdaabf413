pub mod connect;
pub mod forward;
pub mod h1;
pub mod server;

use http::StatusCode;
use tracing::{debug, error};

use crate::http::filters::FilterError;
use crate::http::{Response, plain_response};
use crate::transport::idle::is_idled_error;

/// The wire mapping for upstream I/O failures: timeouts are the origin's
/// fault (504), everything else on the transport is a bad gateway (502).
pub fn status_for_io(err: &std::io::Error) -> StatusCode {
	if err.kind() == std::io::ErrorKind::TimedOut && !is_idled_error(err) {
		StatusCode::GATEWAY_TIMEOUT
	} else {
		StatusCode::BAD_GATEWAY
	}
}

/// Errors we expect from sockets that were deliberately closed or idled out.
/// Sessions end on these without any alarm; they are part of normal pool
/// churn.
pub fn is_expected_disconnect(err: &std::io::Error) -> bool {
	use std::io::ErrorKind::*;
	is_idled_error(err)
		|| matches!(
			err.kind(),
			UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected
		)
}

/// Network timeouts and DNS failures are outside our control; logging them at
/// error level floods the logs, so they are demoted to debug.
pub fn is_benign_net_error(err: &FilterError) -> bool {
	if err.status == StatusCode::GATEWAY_TIMEOUT {
		return true;
	}
	let Some(source) = &err.source else {
		return false;
	};
	source.chain().any(|cause| {
		if let Some(io) = cause.downcast_ref::<std::io::Error>() {
			return io.kind() == std::io::ErrorKind::TimedOut || is_idled_error(io);
		}
		let text = cause.to_string();
		text.contains("failed to lookup") || text.contains("dns error")
	})
}

/// Render a failed filter outcome to the wire: status plus the description as
/// a plain-text body, logged at a level matching its severity.
pub fn error_response(err: &FilterError) -> Response {
	if is_benign_net_error(err) {
		debug!(status = %err.status, "responding with error: {err}");
	} else {
		error!(status = %err.status, "responding with error: {err}");
	}
	plain_response(err.status, err.description.clone())
}
