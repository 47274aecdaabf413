use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use http::StatusCode;
use parking_lot::Mutex;
use proxy_core::prelude::AsyncMutex;
use proxy_core::strng::Strng;
use tracing::error;

use crate::http::{Request, Response};
use crate::proxy::connect::TunnelPlan;
use crate::proxy::forward::UpstreamSession;
use crate::transport::stream::ConnTracker;

/// Immutable per-connection view handed to every filter. Filters attach tags
/// through the tracker; everything else is read-only from their perspective.
pub struct ConnectionState {
	pub peer_addr: SocketAddr,
	pub tracker: Arc<ConnTracker>,
	/// `host:port` recorded by the persistent-session handshake; subsequent
	/// requests on this connection are forwarded there.
	pub pinned_target: Mutex<Option<Strng>>,
	/// The reused upstream leg for the HTTP forwarder.
	pub upstream: AsyncMutex<Option<UpstreamSession>>,
}

impl ConnectionState {
	pub fn new(peer_addr: SocketAddr, tracker: Arc<ConnTracker>) -> ConnectionState {
		ConnectionState {
			peer_addr,
			tracker,
			pinned_target: Mutex::new(None),
			upstream: AsyncMutex::new(None),
		}
	}
}

/// How a request leaves the chain.
#[derive(Debug)]
pub enum Verdict {
	/// A response to serialize back to the client.
	Respond(Response),
	/// Pre-rendered wire bytes; written verbatim and the connection closes.
	/// Used for the Apache mimicry, which must be byte-exact.
	Mimic(Vec<u8>),
	/// Consume the request without writing any bytes (the persistent-session
	/// handshake).
	Discard,
	/// CONNECT accepted: the engine takes over the raw socket.
	Tunnel(TunnelPlan),
}

/// A failed filter outcome: the status to put on the wire plus the
/// human-readable description that becomes the body.
#[derive(thiserror::Error, Debug)]
#[error("{description}")]
pub struct FilterError {
	pub status: StatusCode,
	pub description: String,
	#[source]
	pub source: Option<anyhow::Error>,
}

impl FilterError {
	pub fn new(status: StatusCode, description: impl Into<String>) -> FilterError {
		FilterError {
			status,
			description: description.into(),
			source: None,
		}
	}

	pub fn with_source(mut self, source: anyhow::Error) -> FilterError {
		self.source = Some(source);
		self
	}
}

pub type FilterResult = Result<Verdict, FilterError>;

/// Fail the chain with the given status, logging the description. The
/// counterpart of the original proxy's error-logging `fail` helper.
pub fn fail(status: StatusCode, description: impl Into<String>) -> FilterResult {
	let description = description.into();
	error!("filter fail: {description}");
	Err(FilterError::new(status, description))
}

#[async_trait]
pub trait Filter: Send + Sync {
	async fn apply(&self, cs: &ConnectionState, req: Request, next: Next<'_>) -> FilterResult;
}

/// The handler at the end of the chain: dispatches to the CONNECT engine, the
/// HTTP forwarder, or the mimic.
#[async_trait]
pub trait Terminal: Send + Sync {
	async fn dispatch(&self, cs: &ConnectionState, req: Request) -> FilterResult;
}

/// The tail of the chain from one filter's point of view. Calling `run`
/// invokes the next filter, or the terminal once the filters are exhausted.
pub struct Next<'a> {
	rest: &'a [Arc<dyn Filter>],
	terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
	pub fn run<'b>(self, cs: &'b ConnectionState, req: Request) -> BoxFuture<'b, FilterResult>
	where
		'a: 'b,
	{
		Box::pin(async move {
			match self.rest.split_first() {
				Some((filter, rest)) => {
					filter
						.apply(
							cs,
							req,
							Next {
								rest,
								terminal: self.terminal,
							},
						)
						.await
				},
				None => self.terminal.dispatch(cs, req).await,
			}
		})
	}
}

/// An ordered, immutable sequence of filters.
#[derive(Clone, Default)]
pub struct FilterChain {
	filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
	pub fn new(filters: Vec<Arc<dyn Filter>>) -> FilterChain {
		FilterChain { filters }
	}

	/// A new chain with the given filters appended.
	pub fn and(&self, filters: impl IntoIterator<Item = Arc<dyn Filter>>) -> FilterChain {
		let mut all = self.filters.clone();
		all.extend(filters);
		FilterChain { filters: all }
	}

	pub async fn run(
		&self,
		cs: &ConnectionState,
		req: Request,
		terminal: &dyn Terminal,
	) -> FilterResult {
		Next {
			rest: &self.filters,
			terminal,
		}
		.run(cs, req)
		.await
	}
}
