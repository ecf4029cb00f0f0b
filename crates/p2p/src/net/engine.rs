//! Execute-produce-consume worker pool.
//!
//! A single pool of threads drives all network activity. At any moment
//! at most one thread is the *producer*: it asks the task source for
//! the next unit of work. On producing a task the thread releases the
//! producer role — waking or spawning a successor — and executes the
//! task itself. Only the producer may block, and only inside
//! [`Produce::produce`] (the selector wait), so reading from sockets
//! never starves task production from in-memory state, and vice versa.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// A unit of work handed from the producer to the pool. Tasks are
/// idempotent re-checks of shared state: one that is dropped on the
/// floor resurfaces on a later produce cycle.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A source of unit tasks.
pub trait Produce: Send + Sync + 'static {
    /// Return the next available unit of work. `can_block` is set when
    /// no other thread is executing a task, permitting a bounded wait
    /// for I/O readiness.
    fn produce(&self, can_block: bool) -> Option<Task>;
}

/// Worker pool limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Threads kept alive while idle.
    pub min_threads: usize,
    /// Upper bound on pool size.
    pub max_threads: usize,
    /// How long a surplus idle thread lingers before retiring.
    pub keepalive: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_threads: 1,
            max_threads: 10,
            keepalive: Duration::from_secs(10),
        }
    }
}

/// The worker pool. Dropping the engine does not stop it; call
/// [`Engine::shutdown`].
pub struct Engine {
    shared: Arc<Shared>,
}

struct Shared {
    producer: Weak<dyn Produce>,
    config: PoolConfig,
    /// Set while some thread holds the producer role.
    producing: AtomicBool,
    /// Threads currently executing a task.
    active: AtomicUsize,
    /// Live pool threads.
    threads: AtomicUsize,
    /// Threads parked waiting for the producer role.
    idle: AtomicUsize,
    stopping: AtomicBool,
    gate: Mutex<()>,
    wakeup: Condvar,
    names: AtomicUsize,
}

impl Engine {
    /// Start the pool with `config.min_threads` workers.
    pub fn start(producer: Weak<dyn Produce>, config: PoolConfig) -> Self {
        let shared = Arc::new(Shared {
            producer,
            producing: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            threads: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            gate: Mutex::new(()),
            wakeup: Condvar::new(),
            names: AtomicUsize::new(0),
            config,
        });

        for _ in 0..shared.config.min_threads.max(1) {
            Shared::spawn(&shared);
        }
        Engine { shared }
    }

    /// Stop the pool, waiting up to `grace` for workers to finish their
    /// current task. Stragglers are detached.
    pub fn shutdown(&self, grace: Duration) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_all();

        let deadline = Instant::now() + grace;
        while self.shared.threads.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                debug!(target: "net", "Worker pool did not drain within grace period");
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Shared {
    fn spawn(shared: &Arc<Shared>) {
        let cloned = Arc::clone(shared);
        let n = shared.names.fetch_add(1, Ordering::Relaxed);

        shared.threads.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("p2p-worker-{n}"))
            .spawn(move || cloned.run());
        if spawned.is_err() {
            // The next produce cycle will resurface whatever this
            // thread would have picked up.
            shared.threads.fetch_sub(1, Ordering::SeqCst);
            debug!(target: "net", "Failed to spawn pool worker");
        }
    }

    fn run(self: Arc<Self>) {
        trace!(target: "net", "Worker {} starting", thread::current().name().unwrap_or("?"));

        while !self.stopping.load(Ordering::SeqCst) {
            if self
                .producing
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                // Someone else is producing; park until woken or retire
                // after the keepalive if we're surplus.
                if !self.park() && self.try_retire() {
                    return;
                }
                continue;
            }

            let Some(producer) = self.producer.upgrade() else {
                self.producing.store(false, Ordering::Release);
                break;
            };
            let can_block = self.active.load(Ordering::SeqCst) == 0;
            let task = producer.produce(can_block);
            drop(producer);
            self.producing.store(false, Ordering::Release);

            match task {
                Some(task) => {
                    // Hand the producer role over before doing the work.
                    Shared::ensure_successor(&self);

                    self.active.fetch_add(1, Ordering::SeqCst);
                    task();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                None if can_block => {
                    // The producer already waited inside the selector.
                }
                None => {
                    // Other threads are mid-task; don't spin on produce.
                    self.park_briefly();
                }
            }
        }

        self.threads.fetch_sub(1, Ordering::SeqCst);
        trace!(target: "net", "Worker {} exiting", thread::current().name().unwrap_or("?"));
    }

    /// Make sure another thread will take over producing.
    fn ensure_successor(shared: &Arc<Self>) {
        if shared.idle.load(Ordering::SeqCst) > 0 {
            shared.wakeup.notify_one();
        } else if shared.threads.load(Ordering::SeqCst) < shared.config.max_threads {
            // Every thread is busy; grow the pool.
            Shared::spawn(shared);
        }
    }

    /// Park until woken; `false` means the keepalive elapsed.
    fn park(&self) -> bool {
        let guard = self.gate.lock().expect("pool gate lock is never poisoned");
        self.idle.fetch_add(1, Ordering::SeqCst);
        let (_guard, timeout) = self
            .wakeup
            .wait_timeout(guard, self.config.keepalive)
            .expect("pool gate lock is never poisoned");
        self.idle.fetch_sub(1, Ordering::SeqCst);
        !timeout.timed_out()
    }

    fn park_briefly(&self) {
        let guard = self.gate.lock().expect("pool gate lock is never poisoned");
        self.idle.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .wakeup
            .wait_timeout(guard, Duration::from_millis(10))
            .expect("pool gate lock is never poisoned");
        self.idle.fetch_sub(1, Ordering::SeqCst);
    }

    /// Retire if the pool is above its floor.
    fn try_retire(&self) -> bool {
        let mut threads = self.threads.load(Ordering::SeqCst);
        while threads > self.config.min_threads.max(1) {
            match self.threads.compare_exchange(
                threads,
                threads - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    trace!(target: "net", "Worker retiring after keepalive");
                    return true;
                }
                Err(current) => threads = current,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        remaining: AtomicUsize,
        performed: AtomicUsize,
        this: Mutex<Weak<Counter>>,
    }

    impl Produce for Counter {
        fn produce(&self, _can_block: bool) -> Option<Task> {
            let remaining = &self.remaining;
            if remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
            {
                return None;
            }
            let this = self.this.lock().unwrap().clone();
            Some(Box::new(move || {
                if let Some(this) = this.upgrade() {
                    this.performed.fetch_add(1, Ordering::SeqCst);
                }
            }))
        }
    }

    #[test]
    fn performs_every_produced_task() {
        let counter = Arc::new(Counter {
            remaining: AtomicUsize::new(50),
            performed: AtomicUsize::new(0),
            this: Mutex::new(Weak::new()),
        });
        *counter.this.lock().unwrap() = Arc::downgrade(&counter);

        let engine = Engine::start(
            Arc::downgrade(&counter) as Weak<dyn Produce>,
            PoolConfig {
                min_threads: 2,
                max_threads: 4,
                keepalive: Duration::from_millis(100),
            },
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.performed.load(Ordering::SeqCst) < 50 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        engine.shutdown(Duration::from_secs(1));

        assert_eq!(counter.performed.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn shutdown_stops_the_pool() {
        let counter = Arc::new(Counter {
            remaining: AtomicUsize::new(0),
            performed: AtomicUsize::new(0),
            this: Mutex::new(Weak::new()),
        });
        *counter.this.lock().unwrap() = Arc::downgrade(&counter);

        let engine = Engine::start(Arc::downgrade(&counter) as Weak<dyn Produce>, PoolConfig::default());
        engine.shutdown(Duration::from_secs(1));

        assert_eq!(engine.shared.threads.load(Ordering::SeqCst), 0);
    }
}
