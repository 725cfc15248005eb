//! The intake queue.
//!
//! One queue owns `partitions` fixed-size lock-free channels. Producers pick
//! a channel from the partition key; each channel is drained by exactly one
//! consumer thread, so records sharing a key are consumed in the order they
//! were enqueued.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use metricgrid_core::hash::key_hash;

use crate::config::{Backpressure, QueueConfig};
use crate::consumer::Consumer;
use crate::error::{QueueError, QueueResult};
use crate::signal::Signal;

/// Maps a partition key to a channel index given the channel count.
pub type Partitioner = Arc<dyn Fn(&str, usize) -> usize + Send + Sync>;

/// Point-in-time counters of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub consumed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    consumed: AtomicU64,
    failed: AtomicU64,
}

struct Shared<T> {
    config: QueueConfig,
    channels: Vec<ArrayQueue<T>>,
    partitioner: Partitioner,
    running: AtomicBool,
    /// Producers between their `running` check and the end of their push.
    /// Consumers only exit once this is zero.
    in_flight: AtomicUsize,
    not_full: Signal,
    /// Wake-up signal per channel, shared by the channels of one consumer.
    wakers: OnceLock<Vec<Arc<Signal>>>,
    counters: Counters,
}

impl<T> Shared<T> {
    fn wake(&self, channel: usize) {
        if let Some(wakers) = self.wakers.get() {
            wakers[channel].notify();
        }
    }

    fn wake_all(&self) {
        if let Some(wakers) = self.wakers.get() {
            for waker in wakers {
                waker.notify();
            }
        }
        self.not_full.notify();
    }
}

/// Multi-producer, partitioned intake queue.
pub struct IntakeQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> IntakeQueue<T> {
    /// Create a queue. Fails if the configuration is invalid.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let partitioner: Partitioner =
            Arc::new(|key: &str, n: usize| (key_hash(key) % n as u64) as usize);
        Self::with_partitioner(config, partitioner)
    }

    /// Create a queue with a custom partition function.
    pub fn with_partitioner(config: QueueConfig, partitioner: Partitioner) -> QueueResult<Self> {
        config.validate()?;
        let channels = (0..config.partitions)
            .map(|_| ArrayQueue::new(config.capacity))
            .collect();
        debug!(
            queue = %config.name,
            capacity = config.capacity,
            partitions = config.partitions,
            "intake queue created"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                channels,
                partitioner,
                running: AtomicBool::new(true),
                in_flight: AtomicUsize::new(0),
                not_full: Signal::default(),
                wakers: OnceLock::new(),
                counters: Counters::default(),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn partitions(&self) -> usize {
        self.shared.channels.len()
    }

    /// Channel a partition key maps to.
    pub fn partition_of(&self, partition_key: &str) -> usize {
        let n = self.shared.channels.len();
        (self.shared.partitioner)(partition_key, n) % n
    }

    /// Offer an item to the channel of `partition_key`.
    ///
    /// Returns `false` when the item was rejected: the queue is shut down, or
    /// the channel stayed full under the configured backpressure policy.
    pub fn enqueue(&self, partition_key: &str, item: T) -> bool {
        self.enqueue_with(partition_key, item, self.shared.config.backpressure)
    }

    /// [`IntakeQueue::enqueue`] with `backpressure` in place of the
    /// configured policy.
    pub fn enqueue_with(&self, partition_key: &str, item: T, backpressure: Backpressure) -> bool {
        let shared = &self.shared;
        // Registered before the stop flag is read; pairs with the exit
        // check in `ConsumerLoop::run`.
        let _producer = InFlight::enter(&shared.in_flight);
        if !shared.running.load(Ordering::SeqCst) {
            shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let channel = self.partition_of(partition_key);
        let deadline = match backpressure {
            Backpressure::BoundedWait(timeout) => Some(Instant::now() + timeout),
            _ => None,
        };

        let mut item = item;
        loop {
            // Counted before the push so `is_idle` never runs ahead of a
            // record a consumer may already hold.
            shared.counters.enqueued.fetch_add(1, Ordering::SeqCst);
            match shared.channels[channel].push(item) {
                Ok(()) => {
                    shared.wake(channel);
                    return true;
                }
                Err(rejected) => {
                    shared.counters.enqueued.fetch_sub(1, Ordering::SeqCst);
                    item = rejected;
                }
            }

            let mut wait = shared.config.idle_wait;
            match backpressure {
                Backpressure::DropIfFull => break,
                Backpressure::Blocking => {}
                Backpressure::BoundedWait(_) => {
                    let now = Instant::now();
                    match deadline {
                        Some(deadline) if now < deadline => wait = wait.min(deadline - now),
                        _ => break,
                    }
                }
            }
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            shared.not_full.wait_for(wait, || {
                !shared.channels[channel].is_full() || !shared.running.load(Ordering::Acquire)
            });
        }

        shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Start `concurrency` consumer threads, building one consumer per thread.
    ///
    /// Channels are assigned to threads round-robin. Concurrency above the
    /// partition count is reduced, since a channel never has two consumers.
    pub fn attach_consumer<C, F>(&self, mut factory: F, concurrency: usize) -> QueueResult<()>
    where
        C: Consumer<T>,
        F: FnMut(usize) -> C,
    {
        let shared = &self.shared;
        let partitions = shared.channels.len();
        let mut concurrency = concurrency.max(1);
        if concurrency > partitions {
            warn!(
                queue = %shared.config.name,
                requested = concurrency,
                partitions,
                "consumer concurrency capped at partition count"
            );
            concurrency = partitions;
        }

        let signals: Vec<Arc<Signal>> = (0..concurrency).map(|_| Arc::new(Signal::default())).collect();
        let wakers = (0..partitions)
            .map(|channel| Arc::clone(&signals[channel % concurrency]))
            .collect();
        if shared.wakers.set(wakers).is_err() {
            return Err(QueueError::ConsumerAlreadyAttached {
                queue: shared.config.name.clone(),
            });
        }

        let mut threads = self.threads.lock();
        for (index, signal) in signals.into_iter().enumerate() {
            let owned: Vec<usize> = (index..partitions).step_by(concurrency).collect();
            let consumer = factory(index);
            let worker = ConsumerLoop {
                shared: Arc::clone(shared),
                channels: owned,
                signal,
            };
            let thread_name = format!("{}-consumer-{index}", shared.config.name);
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker.run(consumer))
                .map_err(|source| QueueError::Spawn {
                    queue: shared.config.name.clone(),
                    source,
                })?;
            threads.push(handle);
        }

        debug!(queue = %shared.config.name, concurrency, "consumers attached");
        Ok(())
    }

    /// Records waiting in all channels.
    pub fn depth(&self) -> usize {
        self.shared.channels.iter().map(ArrayQueue::len).sum()
    }

    pub fn backpressure(&self) -> Backpressure {
        self.shared.config.backpressure
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.shared.counters;
        QueueStats {
            enqueued: c.enqueued.load(Ordering::SeqCst),
            dropped: c.dropped.load(Ordering::Relaxed),
            consumed: c.consumed.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
        }
    }

    /// Whether every accepted record has been consumed and its batch closed.
    pub fn is_idle(&self) -> bool {
        let c = &self.shared.counters;
        let settled = c.consumed.load(Ordering::SeqCst) + c.failed.load(Ordering::SeqCst);
        settled == c.enqueued.load(Ordering::SeqCst)
    }

    /// Stop accepting records, let consumers drain what is queued, and join
    /// their threads.
    pub fn shutdown(&self) -> QueueResult<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake_all();

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        let mut result = Ok(());
        for handle in handles {
            let thread = handle.thread().name().unwrap_or("consumer").to_string();
            if handle.join().is_err() {
                error!(queue = %self.shared.config.name, %thread, "consumer thread panicked");
                result = Err(QueueError::ConsumerPanicked {
                    queue: self.shared.config.name.clone(),
                    thread,
                });
            }
        }
        debug!(queue = %self.shared.config.name, "intake queue stopped");
        result
    }
}

impl<T: Send + 'static> Drop for IntakeQueue<T> {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake_all();
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        InFlight(count)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ConsumerLoop<T> {
    shared: Arc<Shared<T>>,
    channels: Vec<usize>,
    signal: Arc<Signal>,
}

impl<T: Send + 'static> ConsumerLoop<T> {
    fn run<C: Consumer<T>>(self, mut consumer: C) {
        let shared = &self.shared;
        loop {
            let mut drained = false;
            for &channel in &self.channels {
                if self.drain_batch(channel, &mut consumer) {
                    drained = true;
                }
            }
            if drained {
                continue;
            }
            if !shared.running.load(Ordering::SeqCst) {
                // A producer that saw the queue running may still be pushing.
                if shared.in_flight.load(Ordering::SeqCst) > 0 {
                    thread::yield_now();
                    continue;
                }
                if self.channels.iter().all(|&c| shared.channels[c].is_empty()) {
                    break;
                }
                continue;
            }
            self.signal.wait_for(shared.config.idle_wait, || {
                !shared.running.load(Ordering::Acquire)
                    || self.channels.iter().any(|&c| !shared.channels[c].is_empty())
            });
        }
    }

    /// Take one closed batch from `channel`. Returns whether anything was taken.
    ///
    /// Counters are updated after `end_of_batch`, so once `consumed + failed`
    /// equals `enqueued` every batch flush has completed.
    fn drain_batch<C: Consumer<T>>(&self, channel: usize, consumer: &mut C) -> bool {
        let shared = &self.shared;
        let queue = &shared.config.name;
        let mut taken: u64 = 0;
        let mut failed: u64 = 0;
        while taken < shared.config.batch_size as u64 {
            let Some(item) = shared.channels[channel].pop() else {
                break;
            };
            taken += 1;
            shared.not_full.notify();

            match panic::catch_unwind(AssertUnwindSafe(|| consumer.consume(item))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    warn!(%queue, channel, error = %e, "consumer rejected record");
                }
                Err(_) => {
                    failed += 1;
                    error!(%queue, channel, "consumer panicked on record");
                }
            }
        }

        if taken == 0 {
            return false;
        }
        if panic::catch_unwind(AssertUnwindSafe(|| consumer.end_of_batch())).is_err() {
            error!(%queue, channel, "consumer panicked at end of batch");
        }
        shared.counters.consumed.fetch_add(taken - failed, Ordering::SeqCst);
        shared.counters.failed.fetch_add(failed, Ordering::SeqCst);
        true
    }
}
