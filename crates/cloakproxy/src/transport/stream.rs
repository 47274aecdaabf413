use std::collections::HashMap;
use std::io::{Error, IoSlice};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use proxy_core::copy::ConnectionStats;
use proxy_core::strng::Strng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use crate::transport::idle::IdleTimeout;

#[derive(Debug, Clone)]
pub struct TcpConnectionInfo {
	pub peer_addr: SocketAddr,
	pub local_addr: SocketAddr,
	pub start: Instant,
}

impl TcpConnectionInfo {
	pub fn of(stream: &TcpStream) -> std::io::Result<TcpConnectionInfo> {
		Ok(TcpConnectionInfo {
			peer_addr: to_canonical(stream.peer_addr()?),
			local_addr: to_canonical(stream.local_addr()?),
			start: Instant::now(),
		})
	}
}

/// Connection lifecycle notifications, mirrored down the listener stack so
/// each wrapper can react. `New` fires on accept, `Active` when a request
/// head has been read, `Idle` after each response is flushed, `Closed` once
/// when the connection is finished.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnState {
	New,
	Active,
	Idle,
	Closed,
}

/// Implemented by every layer that cares about connection lifecycle events.
/// The innermost connection carries one [`ConnTracker`] which fans the
/// notifications out, so wrappers never need to type-assert each other.
pub trait ConnStateHandler: Send + Sync {
	fn on_state(&self, state: ConnState);
}

/// Per-connection context shared between the serve loop, the listener stack
/// and the stats reporter: byte counters, the mutable tag map, and the state
/// fan-out. Lives in an Arc next to the socket for the connection's lifetime.
pub struct ConnTracker {
	stats: Arc<ConnectionStats>,
	tags: Mutex<HashMap<Strng, Strng>>,
	handlers: Mutex<Vec<Arc<dyn ConnStateHandler>>>,
	closed: AtomicBool,
}

impl ConnTracker {
	pub fn new(stats: Arc<ConnectionStats>) -> Arc<ConnTracker> {
		Arc::new(ConnTracker {
			stats,
			tags: Mutex::new(HashMap::new()),
			handlers: Mutex::new(Vec::new()),
			closed: AtomicBool::new(false),
		})
	}

	pub fn stats(&self) -> &Arc<ConnectionStats> {
		&self.stats
	}

	pub fn add_handler(&self, handler: Arc<dyn ConnStateHandler>) {
		self.handlers.lock().push(handler);
	}

	pub fn set_tag(&self, key: Strng, value: Strng) {
		self.tags.lock().insert(key, value);
	}

	pub fn tag(&self, key: &str) -> Option<Strng> {
		self.tags.lock().get(key).cloned()
	}

	pub fn tags(&self) -> HashMap<Strng, Strng> {
		self.tags.lock().clone()
	}

	/// Fan a state change out to every interested layer. `Closed` is
	/// delivered at most once no matter how many paths report it.
	pub fn on_state(&self, state: ConnState) {
		if state == ConnState::Closed && self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		let handlers = self.handlers.lock().clone();
		for h in handlers {
			h.on_state(state);
		}
	}
}

/// A downstream or upstream connection. Reads and writes are counted into the
/// attached [`ConnectionStats`]: bytes read count as received-from-client,
/// bytes written as sent-to-client.
pub struct Socket {
	info: Option<TcpConnectionInfo>,
	inner: SocketType,
	counter: Option<Arc<ConnectionStats>>,
}

impl std::fmt::Debug for Socket {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Socket").field("info", &self.info).finish()
	}
}

pub enum SocketType {
	Tcp(TcpStream),
	Tls(Box<TlsStream<TcpStream>>),
	Timed(IdleTimeout<Box<SocketType>>),
}

impl Socket {
	pub fn from_tcp(stream: TcpStream) -> std::io::Result<Socket> {
		stream.set_nodelay(true)?;
		let info = TcpConnectionInfo::of(&stream)?;
		Ok(Socket {
			info: Some(info),
			inner: SocketType::Tcp(stream),
			counter: None,
		})
	}

	pub fn from_tls(info: Option<TcpConnectionInfo>, tls: TlsStream<TcpStream>) -> Socket {
		Socket {
			info,
			inner: SocketType::Tls(Box::new(tls)),
			counter: None,
		}
	}

	/// Dial an upstream `host:port` with a connect timeout. The socket has no
	/// counter; upstream bytes are accounted on the client-facing socket.
	pub async fn dial(addr: &str, timeout: Duration) -> std::io::Result<Socket> {
		let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
			.await
			.map_err(|_| Error::new(std::io::ErrorKind::TimedOut, format!("dial {addr} timed out")))??;
		Socket::from_tcp(stream)
	}

	/// Close the connection after `timeout` without successful I/O in either
	/// direction.
	pub fn with_idle_timeout(self, timeout: Duration) -> Socket {
		let Socket {
			info,
			inner,
			counter,
		} = self;
		Socket {
			info,
			inner: SocketType::Timed(IdleTimeout::new(Box::new(inner), timeout)),
			counter,
		}
	}

	pub fn with_counter(mut self, counter: Arc<ConnectionStats>) -> Socket {
		self.counter = Some(counter);
		self
	}

	pub fn tcp_info(&self) -> Option<&TcpConnectionInfo> {
		self.info.as_ref()
	}

	pub fn peer_addr(&self) -> Option<SocketAddr> {
		self.info.as_ref().map(|i| i.peer_addr)
	}
}

fn to_canonical(addr: SocketAddr) -> SocketAddr {
	let ip = addr.ip().to_canonical();
	SocketAddr::from((ip, addr.port()))
}

impl AsyncRead for SocketType {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_read(cx, buf),
			SocketType::Tls(inner) => Pin::new(inner).poll_read(cx, buf),
			SocketType::Timed(inner) => Pin::new(inner).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for SocketType {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_write(cx, buf),
			SocketType::Tls(inner) => Pin::new(inner).poll_write(cx, buf),
			SocketType::Timed(inner) => Pin::new(inner).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_flush(cx),
			SocketType::Tls(inner) => Pin::new(inner).poll_flush(cx),
			SocketType::Timed(inner) => Pin::new(inner).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_shutdown(cx),
			SocketType::Tls(inner) => Pin::new(inner).poll_shutdown(cx),
			SocketType::Timed(inner) => Pin::new(inner).poll_shutdown(cx),
		}
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<Result<usize, Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			SocketType::Tls(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			SocketType::Timed(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
		}
	}

	fn is_write_vectored(&self) -> bool {
		match self {
			SocketType::Tcp(inner) => inner.is_write_vectored(),
			SocketType::Tls(inner) => inner.is_write_vectored(),
			SocketType::Timed(inner) => inner.is_write_vectored(),
		}
	}
}

impl AsyncRead for Socket {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		let before = buf.filled().len();
		let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
		let n = buf.filled().len() - before;
		if n > 0
			&& let Some(c) = &self.counter
		{
			c.increment_recv(n as u64);
		}
		poll
	}
}

impl AsyncWrite for Socket {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, Error>> {
		let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
		if let Some(c) = &self.counter
			&& let Poll::Ready(Ok(n)) = poll
		{
			c.increment_sent(n as u64);
		}
		poll
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}

	fn poll_write_vectored(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<Result<usize, Error>> {
		let poll = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
		if let Some(c) = &self.counter
			&& let Poll::Ready(Ok(n)) = poll
		{
			c.increment_sent(n as u64);
		}
		poll
	}

	fn is_write_vectored(&self) -> bool {
		self.inner.is_write_vectored()
	}
}
