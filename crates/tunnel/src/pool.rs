//! Per-service connection pool (spec §3 ConnectionPool, §4.12 pool
//! maintenance). Idle entries carry an insertion timestamp so they can be
//! evicted by age — the Open Question in spec §9 ("idle pool eviction")
//! is resolved here by wrapping pool entries with a timestamp rather than
//! leaving them un-evictable inside a bare bounded channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::Mutex;

pub const MIN_SIZE: usize = 2;
pub const MAX_SIZE: usize = 10;
pub const CHANNEL_CAPACITY: usize = 10;

/// Idle-connection age after which the maintenance loop reports (and, per
/// the Open Question resolution, evicts) an entry (spec §5 "idle pool
/// connections reported after 5 min").
pub const IDLE_REPORT_AGE: Duration = Duration::from_secs(5 * 60);

struct PooledConn {
	stream: TcpStream,
	inserted_at: Instant,
}

/// Reservoir of pre-established client data connections for one tunnel
/// service. The channel-of-entries is guarded by a single async mutex
/// rather than a lock-free bounded channel, so eviction can inspect ages
/// without racing a concurrent pop.
pub struct ConnectionPool {
	entries: Mutex<Vec<PooledConn>>,
	current_size: AtomicUsize,
	min_size: usize,
	max_size: usize,
}

impl Default for ConnectionPool {
	fn default() -> Self {
		Self::new(MIN_SIZE, MAX_SIZE)
	}
}

impl ConnectionPool {
	pub fn new(min_size: usize, max_size: usize) -> Self {
		Self {
			entries: Mutex::new(Vec::with_capacity(max_size.min(CHANNEL_CAPACITY))),
			current_size: AtomicUsize::new(0),
			min_size,
			max_size,
		}
	}

	pub fn current_size(&self) -> usize {
		self.current_size.load(Ordering::Relaxed)
	}

	/// Non-blocking push (spec §4.12 "push the connection into that
	/// service's pool (available channel, non-blocking)"). Returns the
	/// stream back to the caller if the pool is full so it can be closed.
	pub async fn try_push(&self, stream: TcpStream) -> Result<(), TcpStream> {
		let mut entries = self.entries.lock().await;
		if entries.len() >= self.max_size.min(CHANNEL_CAPACITY) {
			return Err(stream);
		}
		entries.push(PooledConn { stream, inserted_at: Instant::now() });
		self.current_size.fetch_add(1, Ordering::Relaxed);
		Ok(())
	}

	/// Pops the most-recently-inserted ready connection, if any.
	pub async fn try_pop(&self) -> Option<TcpStream> {
		let mut entries = self.entries.lock().await;
		let popped = entries.pop();
		if popped.is_some() {
			self.current_size.fetch_sub(1, Ordering::Relaxed);
		}
		popped.map(|e| e.stream)
	}

	/// Maintenance tick (spec §4.12, 30s cadence): returns how many
	/// `pre_connect_request`s are needed to refill toward `minSize`, and
	/// evicts any entries older than [`IDLE_REPORT_AGE`].
	pub async fn maintain(&self) -> usize {
		let mut entries = self.entries.lock().await;
		let before = entries.len();
		entries.retain(|e| e.inserted_at.elapsed() < IDLE_REPORT_AGE);
		let evicted = before - entries.len();
		if evicted > 0 {
			self.current_size.fetch_sub(evicted, Ordering::Relaxed);
			tracing::debug!(evicted, "evicted idle pooled connections");
		}
		let available = entries.len();
		let current = self.current_size.load(Ordering::Relaxed);
		if available < self.min_size && current < self.max_size {
			self.min_size - available
		} else {
			0
		}
	}

	/// Drains and closes every pooled connection (spec §4.12 Shutdown).
	pub async fn drain(&self) {
		let mut entries = self.entries.lock().await;
		let n = entries.len();
		entries.clear();
		self.current_size.fetch_sub(n, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn pair() -> (TcpStream, TcpStream) {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let connect = TcpStream::connect(addr);
		let accept = listener.accept();
		let (a, (b, _)) = tokio::join!(connect, accept);
		(a.unwrap(), b)
	}

	#[tokio::test]
	async fn push_then_pop_round_trips() {
		let pool = ConnectionPool::default();
		let (a, _b) = pair().await;
		pool.try_push(a).await.unwrap();
		assert_eq!(pool.current_size(), 1);
		assert!(pool.try_pop().await.is_some());
		assert_eq!(pool.current_size(), 0);
	}

	#[tokio::test]
	async fn push_past_max_size_is_rejected() {
		let pool = ConnectionPool::new(1, 1);
		let (a, _b) = pair().await;
		pool.try_push(a).await.unwrap();
		let (c, _d) = pair().await;
		assert!(pool.try_push(c).await.is_err());
	}

	#[tokio::test]
	async fn maintain_reports_refill_need_below_min_size() {
		let pool = ConnectionPool::new(2, 10);
		assert_eq!(pool.maintain().await, 2);
		let (a, _b) = pair().await;
		pool.try_push(a).await.unwrap();
		assert_eq!(pool.maintain().await, 1);
	}
}
