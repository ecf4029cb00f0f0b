//! Dedicated broadcast executor.
//!
//! Broadcasts run off the worker pool so a slow fan-out never starves
//! message delivery. Sends to consecutive peers are spaced by a small
//! random delay, which spreads load and gives shutdown a chance to cut
//! a fan-out short.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use quill_types::messages::RawNetworkMessage;

use crate::peer::Peer;

/// Builds the (possibly per-peer) message of a broadcast.
pub type MessageBuilder = Box<dyn Fn(&Arc<Peer>) -> Option<RawNetworkMessage> + Send + Sync>;

pub(crate) struct Job {
    pub peers: Vec<Arc<Peer>>,
    pub builder: MessageBuilder,
    /// Millisecond bounds of the inter-peer delay.
    pub spacing: (u64, u64),
    pub send: Box<dyn Fn(&Arc<Peer>, RawNetworkMessage) + Send>,
}

pub(crate) struct Broadcaster {
    jobs: Mutex<Option<flume::Sender<Job>>>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    pub fn start() -> Self {
        let (tx, rx) = flume::bounded::<Job>(4);
        let stop = Arc::new(AtomicBool::new(false));

        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("p2p-broadcast".into())
            .spawn(move || {
                let mut rng = fastrand::Rng::new();

                for job in rx.iter() {
                    let (min, max) = job.spacing;
                    for peer in &job.peers {
                        if stop_flag.load(Ordering::SeqCst) {
                            return;
                        }
                        if peer.is_disconnected() {
                            continue;
                        }
                        thread::sleep(Duration::from_millis(rng.u64(min..=max.max(min))));

                        if let Some(msg) = (job.builder)(peer) {
                            trace!(
                                target: "p2p",
                                "{}: Broadcasting {:?}",
                                peer.address(),
                                msg.kind()
                            );
                            (job.send)(peer, msg);
                        }
                    }
                }
            })
            .ok();

        Self {
            jobs: Mutex::new(Some(tx)),
            stop,
            handle: Mutex::new(handle),
        }
    }

    /// Queue a broadcast. A full queue drops the job; the next
    /// broadcast window produces a fresh one.
    pub fn submit(&self, job: Job) -> bool {
        let jobs = self.jobs.lock().expect("broadcaster lock is never poisoned");
        match jobs.as_ref() {
            Some(tx) => tx.try_send(job).is_ok(),
            None => false,
        }
    }

    /// Stop the executor, abandoning whatever fan-out is in flight
    /// after `grace`.
    pub fn shutdown(&self, grace: Duration) {
        self.stop.store(true, Ordering::SeqCst);
        self.jobs
            .lock()
            .expect("broadcaster lock is never poisoned")
            .take();

        let handle = self
            .handle
            .lock()
            .expect("broadcaster lock is never poisoned")
            .take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + grace;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                handle.join().ok();
            } else {
                debug!(target: "p2p", "Broadcast executor did not stop within grace period");
            }
        }
    }
}
