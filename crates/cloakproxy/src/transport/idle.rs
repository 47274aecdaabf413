use std::future::Future;
use std::io::{Error, ErrorKind, IoSlice};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Marker wrapped inside the io::Error produced when the watchdog fires, so
/// callers can tell an idled connection apart from a genuine timeout.
#[derive(Debug)]
pub struct IdledOut;

impl std::fmt::Display for IdledOut {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("use of idled network connection")
	}
}

impl std::error::Error for IdledOut {}

pub fn is_idled_error(err: &Error) -> bool {
	err
		.get_ref()
		.map(|inner| inner.is::<IdledOut>())
		.unwrap_or(false)
}

fn idled_error() -> Error {
	Error::new(ErrorKind::TimedOut, IdledOut)
}

/// Watchdog wrapper: any successful read or write re-arms the timer; if it
/// fires while an operation is parked, the operation fails and every
/// subsequent I/O returns the idled error. Dropping the wrapper closes the
/// underlying socket, so the peer observes a real close.
///
/// The deadline is shared between the two directions. `tokio::io::split`
/// serializes polls, so reads and writes never race the reset.
pub struct IdleTimeout<S> {
	inner: S,
	timeout: Duration,
	deadline: Pin<Box<Sleep>>,
	idled: bool,
}

impl<S> IdleTimeout<S> {
	pub fn new(inner: S, timeout: Duration) -> IdleTimeout<S> {
		IdleTimeout {
			inner,
			timeout,
			deadline: Box::pin(tokio::time::sleep(timeout)),
			idled: bool::default(),
		}
	}

	fn rearm(&mut self) {
		let next = Instant::now() + self.timeout;
		self.deadline.as_mut().reset(next);
	}

	fn check_expired(&mut self, cx: &mut Context<'_>) -> Result<(), Error> {
		if self.idled {
			return Err(idled_error());
		}
		if self.deadline.as_mut().poll(cx).is_ready() {
			self.idled = true;
			return Err(idled_error());
		}
		Ok(())
	}
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeout<S> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		let me = self.get_mut();
		if me.idled {
			return Poll::Ready(Err(idled_error()));
		}
		match Pin::new(&mut me.inner).poll_read(cx, buf) {
			Poll::Ready(res) => {
				me.rearm();
				Poll::Ready(res)
			},
			Poll::Pending => match me.check_expired(cx) {
				Ok(()) => Poll::Pending,
				Err(e) => Poll::Ready(Err(e)),
			},
		}
	}
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeout<S> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, Error>> {
		let me = self.get_mut();
		if me.idled {
			return Poll::Ready(Err(idled_error()));
		}
		match Pin::new(&mut me.inner).poll_write(cx, buf) {
			Poll::Ready(res) => {
				me.rearm();
				Poll::Ready(res)
			},
			Poll::Pending => match me.check_expired(cx) {
				Ok(()) => Poll::Pending,
				Err(e) => Poll::Ready(Err(e)),
			},
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		let me = self.get_mut();
		if me.idled {
			return Poll::Ready(Err(idled_error()));
		}
		Pin::new(&mut me.inner).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		let me = self.get_mut();
		Pin::new(&mut me.inner).poll_shutdown(cx)
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<Result<usize, Error>> {
		let me = self.get_mut();
		if me.idled {
			return Poll::Ready(Err(idled_error()));
		}
		match Pin::new(&mut me.inner).poll_write_vectored(cx, bufs) {
			Poll::Ready(res) => {
				me.rearm();
				Poll::Ready(res)
			},
			Poll::Pending => match me.check_expired(cx) {
				Ok(()) => Poll::Pending,
				Err(e) => Poll::Ready(Err(e)),
			},
		}
	}

	fn is_write_vectored(&self) -> bool {
		self.inner.is_write_vectored()
	}
}
