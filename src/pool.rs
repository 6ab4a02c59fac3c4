use std::sync::Mutex;

/// Upper bound on idle buffers kept for reuse
const MAX_POOLED: usize = 32;

/// Recycles fixed-size scratch buffers to bound allocation under load.
///
/// The owning destination cleans the pool when its last stream is deleted.
pub(crate) struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            buffer_size,
        }
    }

    fn buffers(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        self.buffers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// A zeroed buffer of the pool's size, reused when one is idle
    pub fn acquire(&self) -> Vec<u8> {
        match self.buffers().pop() {
            Some(mut buf) => {
                buf.clear();
                buf.resize(self.buffer_size, 0);
                buf
            }
            None => vec![0; self.buffer_size],
        }
    }

    /// Return a buffer for reuse; surplus buffers are dropped
    pub fn release(&self, buf: Vec<u8>) {
        let mut buffers = self.buffers();
        if buffers.len() < MAX_POOLED {
            buffers.push(buf);
        }
    }

    /// Drop all idle buffers
    pub fn clean(&self) {
        self.buffers().clear();
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.buffers().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_reuses() {
        let pool = BufferPool::new(16);
        let mut buf = pool.acquire();
        assert_eq!(buf.len(), 16);
        buf[0] = 0xFF;
        pool.release(buf);
        assert_eq!(pool.idle(), 1);

        let buf = pool.acquire();
        assert_eq!(pool.idle(), 0);
        // recycled buffers come back zeroed
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_clean_drops_idle_buffers() {
        let pool = BufferPool::new(8);
        for _ in 0..4 {
            let buf = pool.acquire();
            pool.release(buf);
        }
        pool.release(pool.acquire());
        assert!(pool.idle() >= 1);
        pool.clean();
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_surplus_buffers_dropped() {
        let pool = BufferPool::new(4);
        let bufs: Vec<_> = (0..MAX_POOLED + 10).map(|_| pool.acquire()).collect();
        for buf in bufs {
            pool.release(buf);
        }
        assert_eq!(pool.idle(), MAX_POOLED);
    }
}
