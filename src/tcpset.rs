//! A bounded pool of TCP connection slots used for AXFR/IXFR transfers,
//! length-prefix framed, with a waiting FIFO for connections that arrive
//! once every slot is in use.
//!
//! `tcpset.c` hand-rolls a read/write state machine per connection over
//! non-blocking sockets, tolerating short reads and `EAGAIN`/`EINTR`. On
//! Tokio, `AsyncReadExt`/`AsyncWriteExt` already give us that tolerance
//! under the hood; what's re-architected here is the *pool bookkeeping* —
//! the fixed capacity, the waiting FIFO, and obtain/release semantics —
//! which has no equivalent already supplied by the runtime. Each
//! connection is still handled by its own task, so a slot here tracks
//! occupancy only; the `TcpStream` itself stays with the task using it.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

/// The maximum number of concurrent TCP transfers.
pub const TCPSET_MAX: usize = 50;

/// Maximum size of a framed message; a larger declared length is treated
/// as fatal rather than allocated.
pub const MAX_MESSAGE_LEN: usize = 65535;

/// A TCP AXFR/IXFR transfer is aborted if it hasn't completed within this
/// long.
pub const TCP_TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub enum TcpError {
    Io(std::io::Error),
    MessageTooLarge(usize),
}

impl std::fmt::Display for TcpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TcpError::Io(e) => write!(f, "tcp i/o error: {e}"),
            TcpError::MessageTooLarge(n) => write!(f, "message length {n} exceeds buffer capacity"),
        }
    }
}

impl std::error::Error for TcpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TcpError::Io(e) => Some(e),
            TcpError::MessageTooLarge(_) => None,
        }
    }
}

impl From<std::io::Error> for TcpError {
    fn from(e: std::io::Error) -> Self {
        TcpError::Io(e)
    }
}

/// Read one length-prefixed message: a 2-octet big-endian length followed
/// by that many bytes. Returns just the payload since Tokio already
/// accounts for partial reads internally.
pub async fn read_framed(stream: &mut TcpStream) -> Result<Vec<u8>, TcpError> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(TcpError::MessageTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write one length-prefixed message, the write-side symmetric operation.
pub async fn write_framed(stream: &mut TcpStream, payload: &[u8]) -> Result<(), TcpError> {
    if payload.len() > MAX_MESSAGE_LEN {
        return Err(TcpError::MessageTooLarge(payload.len()));
    }
    stream.write_all(&(payload.len() as u16).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    Ok(())
}

//----------- TcpSet --------------------------------------------------------------

/// What [`TcpSet::obtain`] reports back to the caller.
pub enum Obtained {
    /// A slot was free; the owner occupies connection slot `index` now.
    Assigned(usize),
    /// No slot was free; the owner was appended to the waiting FIFO.
    Waiting,
}

/// The bounded slot pool plus waiting FIFO.
///
/// Invariants upheld by construction: the active slot count never exceeds
/// `TCPSET_MAX`; the waiting list never contains a token that already
/// holds a slot (callers are expected to call `obtain` at most once per
/// token before releasing it).
pub struct TcpSet<T> {
    slots: Vec<Option<T>>,
    waiting: VecDeque<T>,
}

impl<T> Default for TcpSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TcpSet<T> {
    pub fn new() -> Self {
        Self {
            slots: (0..TCPSET_MAX).map(|_| None).collect(),
            waiting: VecDeque::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// Try to assign `owner` a free slot; if none is free, append to the
    /// waiting FIFO instead.
    pub fn obtain(&mut self, owner: T) -> Obtained {
        if let Some(index) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[index] = Some(owner);
            Obtained::Assigned(index)
        } else {
            self.waiting.push_back(owner);
            Obtained::Waiting
        }
    }

    /// Free slot `index` (on completion, error, or timeout) and return
    /// the next waiting token, if any, so the caller can promote it into
    /// the now-free slot.
    pub fn release(&mut self, index: usize) -> Option<T> {
        self.slots[index] = None;
        self.waiting.pop_front()
    }

    pub fn owner(&self, index: usize) -> Option<&T>
    where
        T: Sized,
    {
        self.slots[index].as_ref()
    }
}

//----------- BoundedPool ----------------------------------------------------------

/// An async front end over [`TcpSet`] for tasks that each own their
/// connection independently: `acquire` suspends the caller until a slot
/// is assigned rather than handing back an unassigned owner for the
/// caller to retry manually.
pub struct BoundedPool<T> {
    inner: Mutex<PoolInner<T>>,
}

struct PoolInner<T> {
    set: TcpSet<T>,
    wakers: VecDeque<oneshot::Sender<usize>>,
}

/// A held slot; releases it automatically when dropped, promoting the
/// next waiting task if one exists.
pub struct PoolPermit<'a, T> {
    pool: &'a BoundedPool<T>,
    index: usize,
}

impl<T> Drop for PoolPermit<'_, T> {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl<T> Default for BoundedPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BoundedPool<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                set: TcpSet::new(),
                wakers: VecDeque::new(),
            }),
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().set.active_count()
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.lock().unwrap().set.waiting_count()
    }

    /// Wait for a free slot, in FIFO order behind anything already
    /// queued. Dropping the returned permit frees the slot and promotes
    /// the next waiter, mirroring [`TcpSet::release`].
    pub async fn acquire(&self, owner: T) -> PoolPermit<'_, T> {
        let assigned = {
            let mut inner = self.inner.lock().unwrap();
            match inner.set.obtain(owner) {
                Obtained::Assigned(index) => Some(index),
                Obtained::Waiting => None,
            }
        };
        let index = match assigned {
            Some(index) => index,
            None => {
                let (tx, rx) = oneshot::channel();
                self.inner.lock().unwrap().wakers.push_back(tx);
                rx.await.expect("pool outlives its waiters")
            }
        };
        PoolPermit { pool: self, index }
    }

    fn release(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        if inner.set.release(index).is_some() {
            if let Some(tx) = inner.wakers.pop_front() {
                let _ = tx.send(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_queue_is_fifo() {
        let mut set: TcpSet<&str> = TcpSet::new();

        for _ in 0..TCPSET_MAX {
            assert!(matches!(set.obtain("zone"), Obtained::Assigned(_)));
        }
        assert_eq!(set.active_count(), TCPSET_MAX);

        assert!(matches!(set.obtain("overflow-zone"), Obtained::Waiting));
        assert_eq!(set.waiting_count(), 1);

        let promoted = set.release(0);
        assert_eq!(promoted, Some("overflow-zone"));
        assert_eq!(set.waiting_count(), 0);
    }

    #[tokio::test]
    async fn bounded_pool_queues_overflow_and_promotes_on_release() {
        let pool = std::sync::Arc::new(BoundedPool::<&str>::new());
        let mut permits = Vec::new();
        for _ in 0..TCPSET_MAX {
            permits.push(pool.acquire("zone").await);
        }
        assert_eq!(pool.active_count(), TCPSET_MAX);

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move {
                let _permit = pool.acquire("overflow-zone").await;
            }
        });

        tokio::task::yield_now().await;
        assert_eq!(pool.waiting_count(), 1);

        permits.pop();
        waiter.await.unwrap();
        assert_eq!(pool.waiting_count(), 0);
    }
}
