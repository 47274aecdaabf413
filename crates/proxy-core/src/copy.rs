use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::pool::Pool;

#[derive(thiserror::Error, Debug)]
pub enum CopyError {
	#[error("io error: {0}")]
	Io(#[from] io::Error),

	#[error("while closing connection: {0}")]
	Shutdown(Box<CopyError>),

	#[error("destination disconnected before all data was written")]
	BackendDisconnected,

	#[error("client disconnected before all data was written")]
	ClientDisconnected,

	#[error("send: {0}")]
	Send(Box<CopyError>),

	#[error("receive: {0}")]
	Receive(Box<CopyError>),
}

/// Byte counters for one connection, from the proxy's client-facing view:
/// `sent` is written to the client, `recv` is read from the client. Counting
/// happens at the socket layer; any task may read these concurrently.
#[derive(Default, Debug)]
pub struct ConnectionStats {
	sent: AtomicU64,
	recv: AtomicU64,
}

impl ConnectionStats {
	pub fn new() -> Arc<ConnectionStats> {
		Arc::new(ConnectionStats::default())
	}

	pub fn increment_sent(&self, amt: u64) {
		self.sent.fetch_add(amt, Ordering::Relaxed);
	}

	pub fn increment_recv(&self, amt: u64) {
		self.recv.fetch_add(amt, Ordering::Relaxed);
	}

	/// Returns (sent, received).
	pub fn load(&self) -> (u64, u64) {
		(
			self.sent.load(Ordering::Relaxed),
			self.recv.load(Ordering::Relaxed),
		)
	}
}

/// Pump bytes both ways between two established streams until either side
/// finishes. Used for CONNECT tunnels, where the streams are opaque.
///
/// Both directions run concurrently; when one returns the other is allowed to
/// complete rather than being cancelled, so a half-closed tunnel still drains.
/// Returns (bytes client->upstream, bytes upstream->client).
pub async fn copy_bidirectional<A, B>(
	downstream: A,
	upstream: B,
	pool: &Pool,
) -> Result<(u64, u64), CopyError>
where
	A: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	let (mut rd, mut wd) = tokio::io::split(downstream);
	let (mut ru, mut wu) = tokio::io::split(upstream);

	let downstream_to_upstream = async {
		let translate = |e: io::Error| {
			CopyError::Send(Box::new(match e.kind() {
				io::ErrorKind::NotConnected | io::ErrorKind::WriteZero => CopyError::BackendDisconnected,
				io::ErrorKind::UnexpectedEof => CopyError::ClientDisconnected,
				_ => e.into(),
			}))
		};
		let res = ignore_io_errors(copy_one_way(&mut rd, &mut wu, pool).await).map_err(translate);
		trace!(?res, "client to upstream complete");
		ignore_shutdown_errors(wu.shutdown().await)
			.map_err(translate)
			.map_err(|e| CopyError::Shutdown(Box::new(e)))?;
		res
	};

	let upstream_to_downstream = async {
		let translate = |e: io::Error| {
			CopyError::Receive(Box::new(match e.kind() {
				io::ErrorKind::NotConnected | io::ErrorKind::WriteZero => CopyError::ClientDisconnected,
				_ => e.into(),
			}))
		};
		let res = ignore_io_errors(copy_one_way(&mut ru, &mut wd, pool).await).map_err(translate);
		trace!(?res, "upstream to client complete");
		ignore_shutdown_errors(wd.shutdown().await)
			.map_err(translate)
			.map_err(|e| CopyError::Shutdown(Box::new(e)))?;
		res
	};

	// join!() rather than try_join!() so one side completing (or failing) still
	// lets the other drain to its own natural end.
	let (up, down) = tokio::join!(downstream_to_upstream, upstream_to_downstream);
	let up = up?;
	let down = down?;
	trace!(up, down, "copy complete");
	Ok((up, down))
}

async fn copy_one_way<R, W>(reader: &mut R, writer: &mut W, pool: &Pool) -> io::Result<u64>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = pool.get();
	let mut amt: u64 = 0;
	loop {
		let n = reader.read(&mut buf[..]).await?;
		if n == 0 {
			writer.flush().await?;
			return Ok(amt);
		}
		writer.write_all(&buf[..n]).await?;
		amt += n as u64;
	}
}

// A TCP connection can close at any time, and a RST mid-copy is ordinary
// behavior for tunneled traffic. Only surface errors that indicate we could
// not move bytes at all.
fn ignore_io_errors(res: Result<u64, io::Error>) -> Result<u64, io::Error> {
	use io::ErrorKind::*;
	match &res {
		Err(e) => match e.kind() {
			NotConnected | UnexpectedEof | ConnectionReset | BrokenPipe => {
				trace!(err=%e, "io terminated ungracefully");
				Ok(0)
			},
			_ => res,
		},
		_ => res,
	}
}

// The peer may have already torn the connection down by the time we shut our
// half; that counts as shut down.
fn ignore_shutdown_errors(res: Result<(), io::Error>) -> Result<(), io::Error> {
	match &res {
		Err(e)
			if e.kind() == io::ErrorKind::NotConnected || e.kind() == io::ErrorKind::UnexpectedEof =>
		{
			trace!(err=%e, "peer already shut down");
			Ok(())
		},
		_ => res,
	}
}
