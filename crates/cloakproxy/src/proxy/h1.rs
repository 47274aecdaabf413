//! Client-side HTTP/1.1 framing. The downstream connection is handled
//! directly rather than through a server framework: the mimic must write
//! byte-exact responses, the persistent handshake consumes a request without
//! answering it, and CONNECT hands the raw socket to the tunnel engine, none
//! of which survive a framing layer that owns the socket.

use std::io::{Error, ErrorKind, IoSlice};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version, header};
use http_body::Body as HttpBody;
use http_body_util::BodyExt;
use proxy_core::strng::Strng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;

use crate::http::Response;

/// Caps the request head; a real client never comes close, and an unbounded
/// buffer is a trivial memory DoS.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
const READ_CHUNK: usize = 8 * 1024;
const MAX_BODY_CHUNK: usize = 64 * 1024;

pub struct RequestHead {
	pub method: Method,
	pub target: Strng,
	pub version: Version,
	pub headers: HeaderMap,
}

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
#[error("malformed request: {0}")]
pub struct ParseError(pub &'static str);

fn invalid_data(msg: &'static str) -> Error {
	Error::new(ErrorKind::InvalidData, msg)
}

/// Buffered reader over the client socket's read half. Bytes that arrive past
/// a request head stay buffered for the body pump or, for CONNECT, for the
/// tunnel splice.
pub struct Buffered<R> {
	rd: R,
	buf: BytesMut,
}

impl<R: AsyncRead + Unpin> Buffered<R> {
	pub fn new(rd: R) -> Buffered<R> {
		Buffered {
			rd,
			buf: BytesMut::with_capacity(READ_CHUNK),
		}
	}

	/// Read one request head, through the blank line. `None` on a clean EOF
	/// before any byte of a new request; `InvalidData` when bytes arrived but
	/// never formed a head.
	pub async fn read_head(&mut self) -> std::io::Result<Option<Bytes>> {
		loop {
			if let Some(pos) = memchr::memmem::find(&self.buf, b"\r\n\r\n") {
				return Ok(Some(self.buf.split_to(pos + 4).freeze()));
			}
			if self.buf.len() > MAX_HEAD_SIZE {
				return Err(invalid_data("request head too large"));
			}
			self.buf.reserve(READ_CHUNK);
			let n = self.rd.read_buf(&mut self.buf).await?;
			if n == 0 {
				if self.buf.is_empty() {
					return Ok(None);
				}
				return Err(invalid_data("connection closed mid request head"));
			}
		}
	}

	/// Up to `max` body bytes; empty on EOF.
	async fn next_chunk(&mut self, max: usize) -> std::io::Result<Bytes> {
		if self.buf.is_empty() {
			self.buf.reserve(READ_CHUNK);
			let n = self.rd.read_buf(&mut self.buf).await?;
			if n == 0 {
				return Ok(Bytes::new());
			}
		}
		let take = self.buf.len().min(max);
		Ok(self.buf.split_to(take).freeze())
	}

	/// One line through its CRLF, returned without the CRLF.
	async fn read_line(&mut self) -> std::io::Result<Bytes> {
		loop {
			if let Some(pos) = memchr::memmem::find(&self.buf, b"\r\n") {
				let mut line = self.buf.split_to(pos + 2);
				line.truncate(pos);
				return Ok(line.freeze());
			}
			if self.buf.len() > READ_CHUNK {
				return Err(invalid_data("chunk size line too long"));
			}
			self.buf.reserve(READ_CHUNK);
			let n = self.rd.read_buf(&mut self.buf).await?;
			if n == 0 {
				return Err(Error::from(ErrorKind::UnexpectedEof));
			}
		}
	}

	async fn expect_crlf(&mut self) -> std::io::Result<()> {
		while self.buf.len() < 2 {
			self.buf.reserve(READ_CHUNK);
			let n = self.rd.read_buf(&mut self.buf).await?;
			if n == 0 {
				return Err(Error::from(ErrorKind::UnexpectedEof));
			}
		}
		let crlf = self.buf.split_to(2);
		if &crlf[..] != b"\r\n" {
			return Err(invalid_data("missing CRLF after chunk"));
		}
		Ok(())
	}

	/// Bytes read past the last head, surrendered for a tunnel splice.
	pub fn take_remaining(&mut self) -> Bytes {
		self.buf.split().freeze()
	}

	pub fn into_inner(self) -> R {
		self.rd
	}
}

pub fn parse_head(raw: &[u8]) -> Result<RequestHead, ParseError> {
	let text = raw
		.strip_suffix(b"\r\n\r\n")
		.ok_or(ParseError("missing head terminator"))?;
	let mut lines = text.split(|&b| b == b'\n').map(|l| l.strip_suffix(b"\r").unwrap_or(l));
	let request_line = lines.next().ok_or(ParseError("empty request"))?;
	let mut parts = request_line.splitn(3, |&b| b == b' ');
	let method = parts.next().filter(|m| !m.is_empty()).ok_or(ParseError("missing method"))?;
	let target = parts.next().filter(|t| !t.is_empty()).ok_or(ParseError("missing request target"))?;
	let version = match parts.next() {
		Some(v) if v == b"HTTP/1.1".as_slice() => Version::HTTP_11,
		Some(v) if v == b"HTTP/1.0".as_slice() => Version::HTTP_10,
		_ => return Err(ParseError("unsupported HTTP version")),
	};
	let method = Method::from_bytes(method).map_err(|_| ParseError("invalid method"))?;
	let target =
		std::str::from_utf8(target).map_err(|_| ParseError("request target is not utf-8"))?;

	let mut headers = HeaderMap::new();
	for line in lines {
		if line.is_empty() {
			continue;
		}
		let colon = memchr::memchr(b':', line).ok_or(ParseError("header line without colon"))?;
		let name = &line[..colon];
		if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace()) {
			return Err(ParseError("invalid header name"));
		}
		let name = HeaderName::from_bytes(name).map_err(|_| ParseError("invalid header name"))?;
		let value = line[colon + 1..].trim_ascii();
		let value = HeaderValue::from_bytes(value).map_err(|_| ParseError("invalid header value"))?;
		headers.append(name, value);
	}
	Ok(RequestHead {
		method,
		target: proxy_core::strng::new(target),
		version,
		headers,
	})
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BodyFraming {
	None,
	Length(u64),
	Chunked,
}

pub fn body_framing(headers: &HeaderMap) -> Result<BodyFraming, ParseError> {
	let chunked = headers
		.get_all(header::TRANSFER_ENCODING)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|t| t.trim().eq_ignore_ascii_case("chunked"));
	if chunked {
		return Ok(BodyFraming::Chunked);
	}
	match headers.get(header::CONTENT_LENGTH) {
		Some(v) => {
			let n: u64 = v
				.to_str()
				.ok()
				.and_then(|v| v.trim().parse().ok())
				.ok_or(ParseError("invalid content-length"))?;
			if n == 0 {
				Ok(BodyFraming::None)
			} else {
				Ok(BodyFraming::Length(n))
			}
		},
		None => Ok(BodyFraming::None),
	}
}

/// Does this request ask for the connection to end after the response?
pub fn wants_close(version: Version, headers: &HeaderMap) -> bool {
	let tokens: Vec<String> = headers
		.get_all(header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.map(|t| t.trim().to_ascii_lowercase())
		.collect();
	if tokens.iter().any(|t| t == "close") {
		return true;
	}
	version == Version::HTTP_10 && !tokens.iter().any(|t| t == "keep-alive")
}

/// Relay the request body from the client into `tx` according to its
/// framing. If the receiver goes away (nothing downstream wanted the body)
/// the remaining bytes are still consumed so the connection stays parseable.
pub async fn pump_body<R: AsyncRead + Unpin>(
	rd: &mut Buffered<R>,
	framing: BodyFraming,
	tx: mpsc::Sender<Result<Bytes, Error>>,
) -> std::io::Result<()> {
	let mut tx = Some(tx);
	match framing {
		BodyFraming::None => Ok(()),
		BodyFraming::Length(n) => {
			let mut remaining = n;
			while remaining > 0 {
				let max = remaining.min(MAX_BODY_CHUNK as u64) as usize;
				let chunk = rd.next_chunk(max).await?;
				if chunk.is_empty() {
					return Err(Error::from(ErrorKind::UnexpectedEof));
				}
				remaining -= chunk.len() as u64;
				send_frame(&mut tx, chunk).await;
			}
			Ok(())
		},
		BodyFraming::Chunked => {
			loop {
				let line = rd.read_line().await?;
				let size = parse_chunk_size(&line)?;
				if size == 0 {
					// Trailer section: lines through the final blank one.
					loop {
						let line = rd.read_line().await?;
						if line.is_empty() {
							return Ok(());
						}
					}
				}
				let mut remaining = size;
				while remaining > 0 {
					let max = remaining.min(MAX_BODY_CHUNK as u64) as usize;
					let chunk = rd.next_chunk(max).await?;
					if chunk.is_empty() {
						return Err(Error::from(ErrorKind::UnexpectedEof));
					}
					remaining -= chunk.len() as u64;
					send_frame(&mut tx, chunk).await;
				}
				rd.expect_crlf().await?;
			}
		},
	}
}

async fn send_frame(tx: &mut Option<mpsc::Sender<Result<Bytes, Error>>>, chunk: Bytes) {
	if let Some(sender) = tx
		&& sender.send(Ok(chunk)).await.is_err()
	{
		// Body was dropped unread; keep draining silently.
		*tx = None;
	}
}

fn parse_chunk_size(line: &[u8]) -> std::io::Result<u64> {
	let size_part = match memchr::memchr(b';', line) {
		Some(i) => &line[..i],
		None => line,
	};
	let text = std::str::from_utf8(size_part)
		.map_err(|_| invalid_data("invalid chunk size"))?
		.trim();
	u64::from_str_radix(text, 16).map_err(|_| invalid_data("invalid chunk size"))
}

/// Serialize a response to the client. Bodies with a known length are sent
/// with `Content-Length`; everything else is re-framed as chunked.
pub async fn write_response<W: AsyncWrite + Unpin>(
	wr: &mut W,
	resp: Response,
	head_only: bool,
) -> std::io::Result<()> {
	let (mut parts, mut body) = resp.into_parts();
	parts.headers.remove(header::TRANSFER_ENCODING);

	let status = parts.status;
	let bodyless_status =
		status.is_informational() || status == http::StatusCode::NO_CONTENT || status == http::StatusCode::NOT_MODIFIED;
	let has_length = parts.headers.contains_key(header::CONTENT_LENGTH);
	let exact = body.size_hint().exact();
	let chunked = !head_only && !bodyless_status && !has_length && exact.is_none();
	if !has_length && !bodyless_status {
		if let Some(n) = exact {
			parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(n));
		}
	}

	let mut head = Vec::with_capacity(256);
	head.extend_from_slice(b"HTTP/1.1 ");
	head.extend_from_slice(status.as_str().as_bytes());
	head.push(b' ');
	head.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
	head.extend_from_slice(b"\r\n");
	for (name, value) in &parts.headers {
		push_title_case(&mut head, name);
		head.extend_from_slice(b": ");
		head.extend_from_slice(value.as_bytes());
		head.extend_from_slice(b"\r\n");
	}
	if chunked {
		head.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
	}
	head.extend_from_slice(b"\r\n");
	wr.write_all(&head).await?;

	if head_only || bodyless_status {
		wr.flush().await?;
		return Ok(());
	}

	while let Some(frame) = body.frame().await {
		let frame = frame.map_err(Error::other)?;
		let Ok(data) = frame.into_data() else {
			continue;
		};
		if data.is_empty() {
			continue;
		}
		if chunked {
			wr.write_all(format!("{:x}\r\n", data.len()).as_bytes())
				.await?;
			wr.write_all(&data).await?;
			wr.write_all(b"\r\n").await?;
		} else {
			wr.write_all(&data).await?;
		}
	}
	if chunked {
		wr.write_all(b"0\r\n\r\n").await?;
	}
	wr.flush().await?;
	Ok(())
}

// hyper normalizes header names to lowercase; write them back out in the
// conventional capitalization so the wire looks like any other HTTP/1.1
// server.
fn push_title_case(out: &mut Vec<u8>, name: &HeaderName) {
	let mut upper = true;
	for &b in name.as_str().as_bytes() {
		if upper {
			out.push(b.to_ascii_uppercase());
		} else {
			out.push(b);
		}
		upper = b == b'-';
	}
}

/// A stream with some already-read bytes stitched back in front, used to
/// splice a tunnel after the CONNECT head (and anything pipelined behind it)
/// has been consumed from the socket.
pub struct Rewound<S> {
	pre: Bytes,
	inner: S,
}

impl<S> Rewound<S> {
	pub fn new(pre: Bytes, inner: S) -> Rewound<S> {
		Rewound { pre, inner }
	}
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewound<S> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		let me = self.get_mut();
		if !me.pre.is_empty() {
			let n = me.pre.len().min(buf.remaining());
			buf.put_slice(&me.pre.split_to(n));
			return Poll::Ready(Ok(()));
		}
		Pin::new(&mut me.inner).poll_read(cx, buf)
	}
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewound<S> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, Error>> {
		Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<Result<usize, Error>> {
		Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
	}

	fn is_write_vectored(&self) -> bool {
		self.inner.is_write_vectored()
	}
}
