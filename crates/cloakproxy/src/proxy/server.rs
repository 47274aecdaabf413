use std::io::ErrorKind;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use http::Method;
use proxy_core::pool::Pool;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::filters::{build_chain, mimic_for_request};
use crate::http::filters::{ConnectionState, FilterChain, FilterResult, Terminal, Verdict};
use crate::http::{Body, ConnectTarget, Request, Uri};
use crate::mimic;
use crate::proxy::connect::{self, ConnectOptions};
use crate::proxy::forward::Forwarder;
use crate::proxy::h1::{self, BodyFraming, Buffered, RequestHead, Rewound};
use crate::proxy::{error_response, is_expected_disconnect};
use crate::stats::{Registry, RegistryReporter};
use crate::transport::limited::{ConnPermit, ConnectionLimit};
use crate::transport::metered::{NoopReporter, Reporter, spawn_reporting};
use crate::transport::stream::{ConnState, ConnTracker, Socket, TcpConnectionInfo};
use crate::transport::tls;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

pub type AllowPredicate = Arc<dyn Fn(IpAddr) -> bool + Send + Sync>;
/// Invoked on a non-temporary accept error; returning true stops the serve
/// loop.
pub type AcceptErrorHook = Arc<dyn Fn(&std::io::Error) -> bool + Send + Sync>;

/// Binds the pieces together: the composed listener stack on one side, the
/// filter chain and the two forwarding engines on the other.
pub struct Server {
	cfg: Config,
	chain: FilterChain,
	dispatch: Dispatch,
	pool: Pool,
	reporter: Arc<dyn Reporter>,
	registry: Arc<Registry>,
	limit: Arc<ConnectionLimit>,
	tls: Option<TlsAcceptor>,
	allow: Option<AllowPredicate>,
	accept_error_hook: Option<AcceptErrorHook>,
}

impl Server {
	pub fn new(cfg: Config) -> anyhow::Result<Server> {
		let connect_opts = ConnectOptions {
			dial_timeout: cfg.dial_timeout,
			idle_timeout: cfg.idle_timeout,
			ok_waits_for_upstream: cfg.ok_waits_for_upstream,
		};
		let dispatch = Dispatch {
			forwarder: Forwarder {
				dial_timeout: cfg.dial_timeout,
				idle_timeout: cfg.idle_timeout,
				response_transform: None,
			},
			connect_opts,
		};
		let registry = Registry::new();
		let reporter: Arc<dyn Reporter> = if cfg.enable_reporter {
			Arc::new(RegistryReporter::new(registry.clone()))
		} else {
			Arc::new(NoopReporter)
		};
		let tls = match &cfg.tls {
			Some(t) => Some(tls::acceptor(&t.cert_file, &t.key_file)?),
			None => None,
		};
		Ok(Server {
			chain: build_chain(&cfg),
			dispatch,
			pool: Pool::default(),
			reporter,
			registry,
			limit: ConnectionLimit::new(cfg.max_conns),
			tls,
			allow: None,
			accept_error_hook: None,
			cfg,
		})
	}

	/// The client registry fed by the metering callbacks; the external stats
	/// reporter scans it.
	pub fn registry(&self) -> Arc<Registry> {
		self.registry.clone()
	}

	pub fn connection_limit(&self) -> Arc<ConnectionLimit> {
		self.limit.clone()
	}

	pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Server {
		self.reporter = reporter;
		self
	}

	pub fn with_allow_predicate(mut self, allow: AllowPredicate) -> Server {
		self.allow = Some(allow);
		self
	}

	pub fn with_accept_error_hook(mut self, hook: AcceptErrorHook) -> Server {
		self.accept_error_hook = Some(hook);
		self
	}

	/// Bind the configured address. The mimicked server's host and port are
	/// fixed from the bound address at this point.
	pub async fn bind(&self) -> anyhow::Result<TcpListener> {
		let listener = TcpListener::bind(&self.cfg.addr).await?;
		let local = listener.local_addr()?;
		mimic::set_host_port(local.ip().to_string(), local.port().to_string());
		info!(addr = %local, tls = self.tls.is_some(), "listening");
		Ok(listener)
	}

	/// Bind and serve until an unrecoverable accept error.
	pub async fn run(cfg: Config) -> anyhow::Result<()> {
		let server = Arc::new(Server::new(cfg)?);
		let listener = server.bind().await?;
		server.serve(listener).await
	}

	pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
		let mut backoff = ACCEPT_BACKOFF_MIN;
		loop {
			self.limit.ready().await;
			match listener.accept().await {
				Ok((stream, peer)) => {
					backoff = ACCEPT_BACKOFF_MIN;
					if let Some(allow) = &self.allow
						&& !allow(peer.ip())
					{
						debug!(peer = %peer, "rejected by allow predicate");
						continue;
					}
					let permit = self.limit.accepted();
					let server = self.clone();
					tokio::spawn(async move {
						server.handle_connection(stream, permit).await;
					});
				},
				Err(e) if is_temporary_accept_error(&e) => {
					warn!("temporary accept error: {e}, retrying in {backoff:?}");
					tokio::time::sleep(backoff).await;
					backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
				},
				Err(e) => {
					if let Some(hook) = &self.accept_error_hook
						&& !hook(&e)
					{
						continue;
					}
					error!("accept failed: {e}");
					return Err(e.into());
				},
			}
		}
	}

	async fn handle_connection(self: Arc<Self>, stream: TcpStream, permit: ConnPermit) {
		let info = match TcpConnectionInfo::of(&stream) {
			Ok(info) => info,
			Err(e) => {
				debug!("dropping connection without peer address: {e}");
				return;
			},
		};
		let socket = match &self.tls {
			Some(acceptor) => match acceptor.accept(stream).await {
				Ok(tls_stream) => Socket::from_tls(Some(info.clone()), tls_stream),
				Err(e) => {
					debug!(peer = %info.peer_addr, "TLS handshake failed: {e}");
					return;
				},
			},
			None => match Socket::from_tcp(stream) {
				Ok(s) => s,
				Err(e) => {
					debug!("failed to prepare socket: {e}");
					return;
				},
			},
		};

		let stats = proxy_core::copy::ConnectionStats::new();
		let socket = socket
			.with_idle_timeout(self.cfg.idle_timeout)
			.with_counter(stats.clone());
		let tracker = ConnTracker::new(stats);
		tracker.add_handler(Arc::new(permit));
		if self.cfg.enable_reporter {
			let meter = spawn_reporting(
				tracker.clone(),
				self.reporter.clone(),
				self.cfg.report_interval,
			);
			tracker.add_handler(meter);
		}
		let cs = ConnectionState::new(info.peer_addr, tracker.clone());
		tracker.on_state(ConnState::New);
		trace!(peer = %info.peer_addr, "connection started");

		// Panics in a connection must not take the server down: log, fail the
		// connection, keep serving.
		let serve = std::panic::AssertUnwindSafe(self.serve_requests(socket, &cs)).catch_unwind();
		if let Err(panic) = serve.await {
			let msg = panic
				.downcast_ref::<&str>()
				.map(|s| s.to_string())
				.or_else(|| panic.downcast_ref::<String>().cloned())
				.unwrap_or_else(|| "unknown panic".to_string());
			error!(peer = %info.peer_addr, "connection task panicked: {msg}");
		}
		tracker.on_state(ConnState::Closed);
		trace!(peer = %info.peer_addr, elapsed = ?info.start.elapsed(), "connection completed");
	}

	async fn serve_requests(&self, socket: Socket, cs: &ConnectionState) {
		let (rd, mut wr) = tokio::io::split(socket);
		let mut rd = Buffered::new(rd);
		loop {
			let head_bytes = match rd.read_head().await {
				Ok(Some(bytes)) => bytes,
				Ok(None) => break,
				Err(e) if e.kind() == ErrorKind::InvalidData => {
					debug!(peer = %cs.peer_addr, "unreadable request: {e}");
					serve_mimic_invalid(&mut wr).await;
					break;
				},
				Err(e) => {
					if is_expected_disconnect(&e) {
						trace!(peer = %cs.peer_addr, "connection ended: {e}");
					} else {
						debug!(peer = %cs.peer_addr, "read error: {e}");
					}
					break;
				},
			};
			let head = match h1::parse_head(&head_bytes) {
				Ok(head) => head,
				Err(e) => {
					debug!(peer = %cs.peer_addr, "unparsable request: {e}");
					serve_mimic_invalid(&mut wr).await;
					break;
				},
			};
			cs.tracker.on_state(ConnState::Active);
			let framing = match h1::body_framing(&head.headers) {
				Ok(f) => f,
				Err(e) => {
					debug!(peer = %cs.peer_addr, "bad body framing: {e}");
					serve_mimic_invalid(&mut wr).await;
					break;
				},
			};
			let close_requested = h1::wants_close(head.version, &head.headers);
			let is_head = head.method == Method::HEAD;
			let req = match build_request(head) {
				Ok(req) => req,
				Err(e) => {
					debug!(peer = %cs.peer_addr, "unusable request target: {e}");
					serve_mimic_invalid(&mut wr).await;
					break;
				},
			};

			// The chain consumes the request while the body pump feeds it from
			// the socket; rejections drain the remaining body so the next head
			// starts on a clean boundary.
			let mut body_broken = false;
			let verdict = if framing == BodyFraming::None {
				self.chain.run(cs, req, &self.dispatch).await
			} else {
				let (tx, rx) = mpsc::channel(8);
				let req = req.map(|_| Body::from_stream(ReceiverStream::new(rx)));
				let (verdict, pumped) = tokio::join!(
					self.chain.run(cs, req, &self.dispatch),
					h1::pump_body(&mut rd, framing, tx)
				);
				if let Err(e) = pumped {
					debug!(peer = %cs.peer_addr, "request body error: {e}");
					body_broken = true;
				}
				verdict
			};

			match verdict {
				Ok(Verdict::Respond(resp)) => {
					if let Err(e) = h1::write_response(&mut wr, resp, is_head).await {
						debug!(peer = %cs.peer_addr, "write error: {e}");
						break;
					}
				},
				Ok(Verdict::Mimic(bytes)) => {
					let _ = wr.write_all(&bytes).await;
					let _ = wr.flush().await;
					break;
				},
				Ok(Verdict::Discard) => {},
				Ok(Verdict::Tunnel(plan)) => {
					let leftover = rd.take_remaining();
					let socket = rd.into_inner().unsplit(wr);
					connect::run_tunnel(
						plan,
						Rewound::new(leftover, socket),
						&self.pool,
						self.dispatch.connect_opts,
					)
					.await;
					return;
				},
				Err(fe) => {
					let resp = error_response(&fe);
					if let Err(e) = h1::write_response(&mut wr, resp, is_head).await {
						debug!(peer = %cs.peer_addr, "write error: {e}");
						break;
					}
				},
			}
			cs.tracker.on_state(ConnState::Idle);
			if close_requested || body_broken {
				break;
			}
		}
	}
}

async fn serve_mimic_invalid(wr: &mut WriteHalf<Socket>) {
	let _ = wr.write_all(&mimic::respond_invalid()).await;
	let _ = wr.flush().await;
}

/// Assemble the typed request from a parsed head. CONNECT targets are carried
/// verbatim in an extension; an unparsable CONNECT authority still reaches
/// the port filters, which report it exactly as sent.
fn build_request(head: RequestHead) -> Result<Request, h1::ParseError> {
	let RequestHead {
		method,
		target,
		version,
		headers,
	} = head;
	let connect = method == Method::CONNECT;
	let uri: Uri = if connect {
		target
			.parse()
			.unwrap_or_else(|_| Uri::from_static("http://invalid/"))
	} else {
		target
			.parse()
			.map_err(|_| h1::ParseError("invalid request target"))?
	};
	let mut req = ::http::Request::builder()
		.method(method)
		.uri(uri)
		.version(version)
		.body(Body::empty())
		.map_err(|_| h1::ParseError("invalid request"))?;
	*req.headers_mut() = headers;
	if connect {
		req.extensions_mut().insert(ConnectTarget(target));
	}
	Ok(req)
}

fn is_temporary_accept_error(e: &std::io::Error) -> bool {
	matches!(
		e.kind(),
		ErrorKind::ConnectionAborted
			| ErrorKind::ConnectionReset
			| ErrorKind::Interrupted
			| ErrorKind::WouldBlock
	) || e
		.raw_os_error()
		.map(|code| {
			// EMFILE / ENFILE: out of descriptors, usually transient under load.
			code == 24 || code == 23
		})
		.unwrap_or(false)
}

struct Dispatch {
	forwarder: Forwarder,
	connect_opts: ConnectOptions,
}

#[async_trait]
impl Terminal for Dispatch {
	async fn dispatch(&self, cs: &ConnectionState, req: Request) -> FilterResult {
		if req.method() == Method::CONNECT {
			return connect::prepare(cs, req, self.connect_opts).await;
		}
		// Proxied requests name their target absolutely, or ride a pinned
		// persistent session. Anything else is a probe of "the web server".
		let pinned = cs.pinned_target.lock().is_some();
		if pinned || req.uri().authority().is_some() {
			return self.forwarder.forward(cs, req).await;
		}
		Ok(Verdict::Mimic(mimic_for_request(&req)))
	}
}

#[cfg(test)]
mod tests {
	use proxy_core::strng;

	use super::*;

	#[test]
	fn connect_request_keeps_raw_target() {
		let head = RequestHead {
			method: Method::CONNECT,
			target: strng::new("site:notaport"),
			version: http::Version::HTTP_11,
			headers: Default::default(),
		};
		let req = build_request(head).unwrap();
		assert_eq!(
			req.extensions().get::<ConnectTarget>().unwrap().0.as_str(),
			"site:notaport"
		);
	}

	#[test]
	fn origin_form_parses() {
		let head = RequestHead {
			method: Method::GET,
			target: strng::new("/index.html"),
			version: http::Version::HTTP_11,
			headers: Default::default(),
		};
		let req = build_request(head).unwrap();
		assert_eq!(req.uri().path(), "/index.html");
		assert!(req.uri().authority().is_none());
	}

	#[test]
	fn absolute_form_keeps_query() {
		let head = RequestHead {
			method: Method::GET,
			target: strng::new("http://origin.test:8080/a?b=c"),
			version: http::Version::HTTP_11,
			headers: Default::default(),
		};
		let req = build_request(head).unwrap();
		assert_eq!(req.uri().authority().unwrap().as_str(), "origin.test:8080");
		assert_eq!(req.uri().query(), Some("b=c"));
	}

	#[test]
	fn temporary_accept_errors() {
		assert!(is_temporary_accept_error(&std::io::Error::from(
			ErrorKind::ConnectionAborted
		)));
		assert!(!is_temporary_accept_error(&std::io::Error::from(
			ErrorKind::PermissionDenied
		)));
	}
}
