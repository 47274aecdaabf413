use std::time::Duration;

use proxy_core::pool::Pool;
use proxy_core::strng::Strng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::http::filters::{ConnectionState, FilterError, FilterResult, Verdict};
use crate::http::{Request, request_authority};
use crate::proxy::status_for_io;
use crate::transport::stream::Socket;

/// What the serve loop needs to take over the client socket after the chain
/// resolves a CONNECT. When `ok_waits_for_upstream` is set, the upstream leg
/// is already dialed here and a failure surfaces as an error response; when
/// it is not, the 200 goes out first and dial failures can only close the
/// tunnel.
#[derive(Debug)]
pub struct TunnelPlan {
	pub target: Strng,
	pub upstream: Option<Socket>,
}

#[derive(Clone, Copy)]
pub struct ConnectOptions {
	pub dial_timeout: Duration,
	pub idle_timeout: Duration,
	pub ok_waits_for_upstream: bool,
}

/// Terminal handling for CONNECT: resolve the target and, if configured to,
/// dial it before promising the client anything.
pub async fn prepare(
	_cs: &ConnectionState,
	req: Request,
	opts: ConnectOptions,
) -> FilterResult {
	let Some(target) = request_authority(&req) else {
		return Err(FilterError::new(
			http::StatusCode::BAD_REQUEST,
			"CONNECT request without a target",
		));
	};
	let upstream = if opts.ok_waits_for_upstream {
		Some(dial(&target, opts).await.map_err(|e| {
			FilterError::new(status_for_io(&e), format!("Unable to dial {target}: {e}"))
				.with_source(e.into())
		})?)
	} else {
		None
	};
	Ok(Verdict::Tunnel(TunnelPlan { target, upstream }))
}

async fn dial(target: &str, opts: ConnectOptions) -> std::io::Result<Socket> {
	let socket = Socket::dial(target, opts.dial_timeout).await?;
	Ok(socket.with_idle_timeout(opts.idle_timeout))
}

/// Run the tunnel: flush the 200, then splice bytes both ways until either
/// side finishes or idles out. The client socket is gone from HTTP framing
/// for good once this is entered.
pub async fn run_tunnel<S>(plan: TunnelPlan, mut downstream: S, pool: &Pool, opts: ConnectOptions)
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let TunnelPlan { target, upstream } = plan;
	let upstream = match upstream {
		Some(up) => {
			// Upstream is already connected; the promise comes after the dial.
			if let Err(e) = downstream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await {
				debug!(dst = target.as_str(), "failed to send CONNECT response: {e}");
				return;
			}
			up
		},
		None => {
			// Promise first, dial second.
			if let Err(e) = downstream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await {
				debug!(dst = target.as_str(), "failed to send CONNECT response: {e}");
				return;
			}
			match dial(&target, opts).await {
				Ok(up) => up,
				Err(e) => {
					// The 200 is already on the wire; all we can do is close.
					debug!(dst = target.as_str(), "unable to dial: {e}");
					return;
				},
			}
		},
	};
	if let Err(e) = downstream.flush().await {
		debug!(dst = target.as_str(), "failed to flush CONNECT response: {e}");
		return;
	}
	match proxy_core::copy::copy_bidirectional(downstream, upstream, pool).await {
		Ok((up, down)) => trace!(dst = target.as_str(), up, down, "tunnel complete"),
		Err(e) => debug!(dst = target.as_str(), "tunnel ended: {e}"),
	}
}
