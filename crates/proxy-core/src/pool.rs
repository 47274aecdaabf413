use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Buffers are sized for one read() worth of tunneled traffic. TLS records max
/// out at 16k, but most proxied chunks are far smaller; 8k keeps the resident
/// cost of a full pool at ~40MB.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;
/// Maximum buffers retained when idle. Matches the historical shared-pool cap.
pub const DEFAULT_MAX_BUFFERS: usize = 5000;

/// Pool hands out uniform byte buffers for the copy loops. `get` pops a free
/// buffer or allocates when the pool is empty; dropping the returned
/// [`PooledBuf`] puts it back, or releases it to the allocator when the pool
/// is already full.
#[derive(Clone)]
pub struct Pool {
	inner: Arc<Shared>,
}

struct Shared {
	free: Mutex<Vec<Vec<u8>>>,
	buffer_size: usize,
	max_buffers: usize,
}

impl Default for Pool {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_BUFFERS, DEFAULT_BUFFER_SIZE)
	}
}

impl Pool {
	pub fn new(max_buffers: usize, buffer_size: usize) -> Pool {
		Pool {
			inner: Arc::new(Shared {
				free: Mutex::new(Vec::new()),
				buffer_size,
				max_buffers,
			}),
		}
	}

	pub fn buffer_size(&self) -> usize {
		self.inner.buffer_size
	}

	pub fn get(&self) -> PooledBuf {
		let buf = self
			.inner
			.free
			.lock()
			.pop()
			.unwrap_or_else(|| vec![0u8; self.inner.buffer_size]);
		PooledBuf {
			buf,
			pool: self.inner.clone(),
		}
	}

	/// Number of buffers currently parked in the pool.
	pub fn idle(&self) -> usize {
		self.inner.free.lock().len()
	}
}

/// A buffer checked out of a [`Pool`]. Callers must not retain the contents
/// past drop; the same storage will be handed to the next caller.
pub struct PooledBuf {
	buf: Vec<u8>,
	pool: Arc<Shared>,
}

impl Deref for PooledBuf {
	type Target = [u8];
	fn deref(&self) -> &Self::Target {
		&self.buf
	}
}

impl DerefMut for PooledBuf {
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self.buf
	}
}

impl Drop for PooledBuf {
	fn drop(&mut self) {
		let mut free = self.pool.free.lock();
		if free.len() < self.pool.max_buffers {
			free.push(std::mem::take(&mut self.buf));
		}
		// Otherwise let the allocator have it back.
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reuses_returned_buffers() {
		let pool = Pool::new(4, 16);
		let first = pool.get();
		let ptr = first.as_ptr();
		drop(first);
		assert_eq!(pool.idle(), 1);
		let second = pool.get();
		assert_eq!(second.as_ptr(), ptr);
		assert_eq!(second.len(), 16);
	}

	#[test]
	fn allocates_when_empty() {
		let pool = Pool::new(2, 8);
		let a = pool.get();
		let b = pool.get();
		let c = pool.get();
		assert_eq!(pool.idle(), 0);
		assert_eq!((a.len(), b.len(), c.len()), (8, 8, 8));
	}

	#[test]
	fn drops_overflow() {
		let pool = Pool::new(1, 8);
		let a = pool.get();
		let b = pool.get();
		drop(a);
		drop(b);
		// The second return found the pool full and was released.
		assert_eq!(pool.idle(), 1);
	}
}
