//! Control-thread executor
//!
//! Work produced on the streaming thread (gate callbacks) is handed to an
//! `IdleQueue` and executed later on the control thread, either by polling
//! [`IdleQueue::dispatch_pending`] or by driving [`IdleQueue::run`] on a tokio
//! runtime. Timeouts scheduled with [`IdleHandle::schedule_after`] become ready
//! once their deadline passes.

use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

/// Upper bound on how long `wait` sleeps with no timer armed
const IDLE_POLL: Duration = Duration::from_secs(3600);

struct Timer<T> {
    due: Instant,
    seq: u64,
    task: T,
}

struct Shared<T> {
    tx: mpsc::UnboundedSender<T>,
    timers: Mutex<Vec<Timer<T>>>,
    wake: Notify,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

/// Cloneable, thread-safe scheduling side of an [`IdleQueue`]
pub struct IdleHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for IdleHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send> IdleHandle<T> {
    /// Queue `task` to run on the next dispatch. Returns false once the
    /// queue has been closed.
    pub fn schedule(&self, task: T) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        if self.shared.tx.send(task).is_err() {
            return false;
        }
        self.shared.wake.notify_one();
        true
    }

    /// Queue `task` to run once `delay` has elapsed.
    pub fn schedule_after(&self, delay: Duration, task: T) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        self.shared.timers.lock().push(Timer {
            due: Instant::now() + delay,
            seq,
            task,
        });
        self.shared.wake.notify_one();
        true
    }
}

pub struct IdleQueue<T> {
    handle: IdleHandle<T>,
    rx: Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T: Send> IdleQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handle: IdleHandle {
                shared: Arc::new(Shared {
                    tx,
                    timers: Mutex::new(Vec::new()),
                    wake: Notify::new(),
                    next_seq: AtomicU64::new(0),
                    closed: AtomicBool::new(false),
                }),
            },
            rx: Mutex::new(rx),
        }
    }

    pub fn handle(&self) -> IdleHandle<T> {
        self.handle.clone()
    }

    pub fn schedule(&self, task: T) -> bool {
        self.handle.schedule(task)
    }

    pub fn schedule_after(&self, delay: Duration, task: T) -> bool {
        self.handle.schedule_after(delay, task)
    }

    /// Run every queued task and every expired timeout without blocking.
    ///
    /// Tasks scheduled by `run_task` itself are picked up in the same call.
    /// Returns how many tasks ran.
    pub fn dispatch_pending(&self, mut run_task: impl FnMut(T)) -> usize {
        let mut ran = 0;
        loop {
            let ready = self.take_ready();
            if ready.is_empty() {
                return ran;
            }
            for task in ready {
                run_task(task);
                ran += 1;
            }
        }
    }

    fn take_ready(&self) -> Vec<T> {
        let mut ready = Vec::new();
        {
            let mut rx = self.rx.lock();
            while let Ok(task) = rx.try_recv() {
                ready.push(task);
            }
        }

        let now = Instant::now();
        let mut timers = self.handle.shared.timers.lock();
        let mut expired: Vec<Timer<T>> = Vec::new();
        let mut i = 0;
        while i < timers.len() {
            if timers[i].due <= now {
                expired.push(timers.swap_remove(i));
            } else {
                i += 1;
            }
        }
        expired.sort_by_key(|t| (t.due, t.seq));
        ready.extend(expired.into_iter().map(|t| t.task));
        ready
    }

    /// Earliest armed timeout, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.handle.shared.timers.lock().iter().map(|t| t.due).min()
    }

    pub fn pending(&self) -> usize {
        self.rx.lock().len() + self.handle.shared.timers.lock().len()
    }

    /// Sleep until a task is scheduled or the next timeout expires.
    pub async fn wait(&self) {
        let deadline = self
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_POLL);
        tokio::select! {
            _ = self.handle.shared.wake.notified() => {}
            _ = tokio::time::sleep_until(deadline.into()) => {}
        }
    }

    /// Dispatch tasks as they become ready until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken, mut run_task: impl FnMut(T)) {
        loop {
            self.dispatch_pending(&mut run_task);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wait() => {}
            }
        }
        debug!("IdleQueue: run loop cancelled");
    }

    /// Drop every queued task and refuse new ones.
    pub fn close(&self) -> usize {
        self.handle.shared.closed.store(true, Ordering::Release);
        let mut dropped = 0;
        {
            let mut rx = self.rx.lock();
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
        }
        let mut timers = self.handle.shared.timers.lock();
        dropped += timers.len();
        timers.clear();
        dropped
    }
}

impl<T: Send> Default for IdleQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
