//! Serialized access to the session's transport.
//!
//! Commits and frame polls each hold the transport for one whole logical
//! operation. Frame polling backs off while a request is queued so a commit
//! waits for at most one poll interval.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use mokulink_transport::{Transport, TransportError};

use crate::error::{MokuError, Result};
use crate::lock;

const BACKOFF: Duration = Duration::from_millis(1);

pub struct SharedTransport {
    inner: Mutex<Box<dyn Transport>>,
    waiting: AtomicUsize,
}

struct Waiting<'a>(&'a AtomicUsize);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SharedTransport {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            inner: Mutex::new(transport),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Exclusive access for a request, waiting at most `timeout`.
    pub fn acquire(&self, timeout: Duration) -> Result<MutexGuard<'_, Box<dyn Transport>>> {
        self.waiting.fetch_add(1, Ordering::AcqRel);
        let _waiting = Waiting(&self.waiting);
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) if Instant::now() >= deadline => {
                    return Err(MokuError::Network(TransportError::Timeout(timeout)));
                }
                Err(TryLockError::WouldBlock) => thread::sleep(BACKOFF),
            }
        }
    }

    /// Access for one frame poll. Yields to any queued request first.
    pub(crate) fn acquire_for_poll(&self) -> MutexGuard<'_, Box<dyn Transport>> {
        while self.waiting.load(Ordering::Acquire) > 0 {
            thread::sleep(BACKOFF);
        }
        lock(&self.inner)
    }
}

impl std::fmt::Debug for SharedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTransport")
            .field("waiting", &self.waiting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mokulink_transport::mock::MockTransport;

    use super::*;

    #[test]
    fn acquire_times_out_while_held() {
        let (mock, _handle) = MockTransport::new();
        let shared = Arc::new(SharedTransport::new(Box::new(mock)));
        let _held = shared.acquire(Duration::from_secs(1)).unwrap();

        let other = Arc::clone(&shared);
        let result = thread::spawn(move || {
            other
                .acquire(Duration::from_millis(20))
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .join()
        .unwrap();
        assert!(result.unwrap_err().contains("did not respond"));
    }

    #[test]
    fn request_is_served_after_poll_releases() {
        let (mock, _handle) = MockTransport::new();
        let shared = Arc::new(SharedTransport::new(Box::new(mock)));
        let poll = shared.acquire_for_poll();

        let other = Arc::clone(&shared);
        let request = thread::spawn(move || other.acquire(Duration::from_secs(2)).is_ok());
        thread::sleep(Duration::from_millis(20));
        drop(poll);
        assert!(request.join().unwrap());
    }
}
