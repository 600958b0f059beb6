use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub type Callback<T> = Box<dyn Fn(Vec<T>) + Send + Sync>;

/// Bounded buffer that hands batches to a callback, either when `capacity`
/// items have accumulated or when no item arrived for `timeout`.
///
/// A single mutex guards the buffer and the idle deadline; the callback runs
/// under it, so invocations are strictly serialized and `add` blocks for the
/// duration of a flush. The idle timer is a dedicated thread parked on a
/// condvar and re-armed by every `add`, not a polling loop.
pub struct BatchQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    timer: Option<JoinHandle<()>>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    idle: Condvar,
    capacity: usize,
    timeout: Duration,
    callback: Callback<T>,
}

struct Inner<T> {
    buf: Vec<T>,
    deadline: Option<Instant>,
    shutdown: bool,
}

impl<T> Shared<T> {
    /// Must be called with the lock held. Empty buffers are skipped: an idle
    /// timer firing with nothing pending produces no callback.
    fn flush(&self, inner: &mut Inner<T>) {
        if inner.buf.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut inner.buf);
        (self.callback)(batch);
    }

    fn timer_loop(&self) {
        let mut inner = self.inner.lock();
        loop {
            if inner.shutdown {
                return;
            }
            match inner.deadline {
                None => {
                    self.idle.wait(&mut inner);
                }
                Some(deadline) => {
                    self.idle.wait_until(&mut inner, deadline);
                    if inner.shutdown {
                        return;
                    }
                    // The deadline may have been pushed out by an `add` that
                    // ran while we slept; only fire if it has truly passed.
                    if inner.deadline.is_some_and(|d| Instant::now() >= d) {
                        self.flush(&mut inner);
                        inner.deadline = None;
                    }
                }
            }
        }
    }
}

impl<T: Send + 'static> BatchQueue<T> {
    pub fn new(capacity: usize, timeout: Duration, callback: Callback<T>) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                buf: Vec::with_capacity(capacity),
                deadline: None,
                shutdown: false,
            }),
            idle: Condvar::new(),
            capacity,
            timeout,
            callback,
        });

        let timer_shared = shared.clone();
        let timer = std::thread::Builder::new()
            .name("batch-queue-timer".into())
            .spawn(move || timer_shared.timer_loop())
            .ok();

        Self { shared, timer }
    }

    pub fn add(&self, item: T) {
        let mut inner = self.shared.inner.lock();
        inner.buf.push(item);

        if inner.buf.len() >= self.shared.capacity {
            self.shared.flush(&mut inner);
            inner.deadline = None;
        } else {
            inner.deadline = Some(Instant::now() + self.shared.timeout);
        }
        self.shared.idle.notify_one();
    }

    /// Flush whatever is pending and stop the timer thread.
    pub fn drain(self) {}
}

impl<T: Send + 'static> Drop for BatchQueue<T> {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.inner.lock();
            self.shared.flush(&mut inner);
            inner.shutdown = true;
            self.shared.idle.notify_one();
        }
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}
