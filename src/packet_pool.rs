use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tracing::trace;

/// A pool of fragment-sized payload buffers.
///
/// Every fragment that is received or sent needs a payload buffer of (up to) the configured
///  fragment size, and at steady state these churn at packet rate. The pool keeps a bounded
///  free list of uniformly sized buffers so the hot path allocates only when the pool runs dry.
///
/// Buffers return to the pool when the [PooledBuf] handle is dropped, i.e. when the last owner
///  lets go of it. Oversize buffers (requested above the nominal fragment size) are handed out
///  as one-off allocations and never pooled.
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buf_size: usize,
    max_pool_size: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl PacketPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> PacketPool {
        PacketPool {
            inner: Arc::new(PoolInner {
                buf_size,
                max_pool_size,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The nominal buffer size - requests up to this are served from the free list.
    pub fn buf_size(&self) -> usize {
        self.inner.buf_size
    }

    /// Get a cleared buffer with capacity for at least `min_size` bytes.
    pub fn acquire(&self, min_size: usize) -> PooledBuf {
        if min_size > self.inner.buf_size {
            trace!("oversize buffer request ({} > {}), allocating outside the pool", min_size, self.inner.buf_size);
            return PooledBuf {
                buf: Some(BytesMut::with_capacity(min_size)),
                pool: self.inner.clone(),
            };
        }

        let recycled = self.inner.free.lock().unwrap().pop();
        let buf = match recycled {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => BytesMut::with_capacity(self.inner.buf_size),
        };

        PooledBuf {
            buf: Some(buf),
            pool: self.inner.clone(),
        }
    }

    #[cfg(test)]
    pub fn free_len(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }
}

/// An owned buffer that returns itself to its pool on drop.
pub struct PooledBuf {
    buf: Option<BytesMut>,
    pool: Arc<PoolInner>,
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = self.buf.take()
            .unwrap(); // only ever taken here, and drop runs once

        // NB: oversize buffers fail this check and are simply freed
        if buf.capacity() == self.pool.buf_size {
            let mut free = self.pool.free.lock().unwrap();
            if free.len() < self.pool.max_pool_size {
                free.push(buf);
            }
            else {
                trace!("pool is full, discarding returned buffer");
            }
        }
    }
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().unwrap()
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().unwrap()
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.buf.as_ref().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use rstest::rstest;

    #[test]
    fn test_acquire_reuses_returned_buffer() {
        let pool = PacketPool::new(1024, 4);

        let mut buf = pool.acquire(100);
        buf.put_slice(b"hello");
        drop(buf);
        assert_eq!(pool.free_len(), 1);

        let buf = pool.acquire(100);
        assert_eq!(buf.len(), 0); // recycled buffers come back cleared
        assert_eq!(buf.capacity(), 1024);
        assert_eq!(pool.free_len(), 0);
    }

    #[test]
    fn test_pool_size_is_bounded() {
        let pool = PacketPool::new(64, 2);

        let bufs: Vec<PooledBuf> = (0..5).map(|_| pool.acquire(10)).collect();
        drop(bufs);

        assert_eq!(pool.free_len(), 2);
    }

    #[rstest]
    #[case::at_limit(64, true)]
    #[case::oversize(65, false)]
    fn test_oversize_buffers_are_not_pooled(#[case] requested: usize, #[case] expected_pooled: bool) {
        let pool = PacketPool::new(64, 4);

        let buf = pool.acquire(requested);
        assert!(buf.capacity() >= requested);
        drop(buf);

        assert_eq!(pool.free_len(), if expected_pooled { 1 } else { 0 });
    }

    #[test]
    fn test_pool_is_shared_across_clones() {
        let pool = PacketPool::new(64, 4);
        let clone = pool.clone();

        drop(clone.acquire(10));
        assert_eq!(pool.free_len(), 1);
    }

    #[test]
    fn test_pool_stays_bounded_under_concurrent_churn() {
        let pool = PacketPool::new(64, 3);

        let workers: Vec<_> = (0..8).map(|_| {
            let pool = pool.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let mut buf = pool.acquire(if i % 5 == 0 { 100 } else { 10 });
                    buf.put_slice(b"x");
                    drop(buf);
                    assert!(pool.free_len() <= 3);
                }
            })
        }).collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert!(pool.free_len() <= 3);
    }
}
