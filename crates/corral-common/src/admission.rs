//! Ticket-based admission control.
//!
//! An [`AdmissionController`] bounds how many guarded operations run at once.
//! Capacity is a pool of `max_concurrent` tickets. When the pool is empty the
//! controller either rejects immediately or, if a wait queue is configured,
//! parks the caller in a bounded FIFO queue until a ticket frees up or its
//! wait deadline passes.
//!
//! # Configurations
//!
//! - **Disabled**: `max_concurrent == 0`. Every acquire succeeds.
//! - **Hard cap**: `max_wait_num == 0`. Acquire fails with
//!   [`CorralError::Capacity`] as soon as the pool is empty.
//! - **Hard cap with queue**: up to `max_wait_num` callers wait at most
//!   `max_wait` each. A background sweep grants tickets to the head of the
//!   queue every `sweep_interval`.
//!
//! # Example
//!
//! ```no_run
//! use corral_common::admission::{AdmissionConfig, AdmissionController};
//! use corral_common::Shutdown;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> corral_common::Result<()> {
//! let config = AdmissionConfig::hard_cap(64).with_queue(128, Duration::from_secs(5));
//! let admission = AdmissionController::new(config, Shutdown::new())?;
//!
//! let ticket = admission.acquire().await?;
//! // ... guarded work ...
//! drop(ticket);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{CorralError, Result};
use crate::shutdown::Shutdown;

/// Default upper bound on how long a queued caller waits for a ticket.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5);

/// Default period of the queue sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Admission controller settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Size of the ticket pool. `0` disables limiting.
    pub max_concurrent: usize,
    /// Maximum number of parked callers. `0` means fail fast.
    pub max_wait_num: usize,
    /// How long a parked caller waits before failing. Zero means
    /// [`DEFAULT_MAX_WAIT`].
    pub max_wait: Duration,
    /// Period of the background sweep that serves the queue.
    pub sweep_interval: Duration,
}

impl AdmissionConfig {
    /// Limits concurrency to `max_concurrent` and rejects immediately when full.
    pub fn hard_cap(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            ..Self::default()
        }
    }

    /// Adds a FIFO wait queue of `max_wait_num` entries, each waiting at most
    /// `max_wait`. A zero `max_wait` falls back to [`DEFAULT_MAX_WAIT`].
    pub fn with_queue(mut self, max_wait_num: usize, max_wait: Duration) -> Self {
        self.max_wait_num = max_wait_num;
        self.max_wait = max_wait;
        self.normalized()
    }

    fn normalized(mut self) -> Self {
        if self.max_wait.is_zero() {
            self.max_wait = DEFAULT_MAX_WAIT;
        }
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.max_concurrent > 0
    }

    /// Whether callers may be parked instead of rejected.
    pub fn has_queue(&self) -> bool {
        self.is_enabled() && self.max_wait_num > 0
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.has_queue() && self.sweep_interval.is_zero() {
            return Err("sweep_interval must be greater than 0".into());
        }
        Ok(())
    }
}

impl Default for AdmissionConfig {
    /// Disabled limiter with the standard queue timings.
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            max_wait_num: 0,
            max_wait: DEFAULT_MAX_WAIT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// One unit of admitted concurrency.
///
/// The ticket goes back to the pool when dropped, so it is released exactly
/// once on every exit path of the guarded operation.
#[derive(Debug)]
#[must_use = "dropping a ticket releases it immediately"]
pub struct Ticket {
    permit: Option<OwnedSemaphorePermit>,
}

impl Ticket {
    /// Returns the ticket to the pool. No-op for a disabled controller.
    pub fn release(self) {}

    /// `false` when issued by a disabled controller.
    pub fn is_limited(&self) -> bool {
        self.permit.is_some()
    }
}

struct WaitEntry {
    deadline: Instant,
    notify: oneshot::Sender<OwnedSemaphorePermit>,
}

struct Inner {
    config: AdmissionConfig,
    tickets: Arc<Semaphore>,
    queue: Mutex<VecDeque<WaitEntry>>,
    closed: AtomicBool,
    shutdown: Shutdown,
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.shutdown.is_triggered()
    }

    /// Serves the queue from the head. Stops at the first live entry that
    /// cannot get a ticket, so no later entry is ever granted ahead of it.
    fn sweep(&self) {
        let mut queue = self.queue.lock();
        queue.retain(|entry| !entry.notify.is_closed());

        let now = Instant::now();
        while let Some(head) = queue.front() {
            if head.deadline <= now {
                // Dropping the sender wakes the waiter with a failure.
                drop(queue.pop_front());
                continue;
            }

            let permit = match self.tickets.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if let Some(entry) = queue.pop_front() {
                // A waiter that gave up in the meantime hands the permit back on drop.
                let _ = entry.notify.send(permit);
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tickets.close();

        let parked: Vec<WaitEntry> = self.queue.lock().drain(..).collect();
        if !parked.is_empty() {
            tracing::info!(waiters = parked.len(), "admission controller closed, failing parked waiters");
        }
    }
}

/// Concurrency gate shared by every task guarding the same resource.
///
/// Cloning is cheap; clones share one ticket pool and queue.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl AdmissionController {
    /// Creates a controller and, if a queue is configured, spawns its sweep task.
    ///
    /// The sweep stops when `shutdown` fires or the last controller handle is dropped.
    /// Must be called from within a Tokio runtime when a queue is configured.
    pub fn new(config: AdmissionConfig, shutdown: Shutdown) -> Result<Self> {
        config.validate().map_err(CorralError::InvalidConfig)?;
        let config = config.normalized();

        let inner = Arc::new(Inner {
            tickets: Arc::new(Semaphore::new(config.max_concurrent)),
            queue: Mutex::new(VecDeque::with_capacity(config.max_wait_num)),
            closed: AtomicBool::new(false),
            shutdown: shutdown.clone(),
            config,
        });

        if inner.config.has_queue() {
            let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
                CorralError::InvalidConfig(format!("admission queue needs a Tokio runtime: {}", e))
            })?;
            runtime.spawn(sweep_loop(
                Arc::downgrade(&inner),
                inner.config.sweep_interval,
                shutdown,
            ));
        }

        Ok(Self { inner })
    }

    /// A controller that admits everything.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(Inner {
                config: AdmissionConfig::default(),
                tickets: Arc::new(Semaphore::new(0)),
                queue: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                shutdown: Shutdown::new(),
            }),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.inner.config
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.is_enabled()
    }

    /// Takes a ticket without waiting.
    ///
    /// # Errors
    ///
    /// - [`CorralError::Capacity`] if no ticket is free
    /// - [`CorralError::Shutdown`] once the controller is closed
    pub fn try_acquire(&self) -> Result<Ticket> {
        if !self.is_enabled() {
            return Ok(Ticket { permit: None });
        }
        if self.inner.is_closed() {
            return Err(CorralError::Shutdown);
        }
        match self.inner.tickets.clone().try_acquire_owned() {
            Ok(permit) => Ok(Ticket { permit: Some(permit) }),
            Err(TryAcquireError::NoPermits) => Err(CorralError::Capacity),
            Err(TryAcquireError::Closed) => Err(CorralError::Shutdown),
        }
    }

    /// Takes a ticket, parking in the wait queue if one is configured.
    ///
    /// A parked caller is woken by the sweep with either a ticket or a
    /// failure once its deadline passes.
    ///
    /// # Errors
    ///
    /// - [`CorralError::Capacity`] if the pool is empty and the queue is
    ///   absent, full, or the wait timed out
    /// - [`CorralError::Shutdown`] once the controller is closed
    pub async fn acquire(&self) -> Result<Ticket> {
        match self.try_acquire() {
            Err(CorralError::Capacity) if self.inner.config.has_queue() => {}
            other => return other,
        }

        let rx = {
            let mut queue = self.inner.queue.lock();
            // Checked under the queue lock so `close` cannot miss this entry.
            if self.inner.is_closed() {
                return Err(CorralError::Shutdown);
            }
            if queue.len() >= self.inner.config.max_wait_num {
                tracing::debug!(queued = queue.len(), "admission queue full");
                return Err(CorralError::Capacity);
            }
            let (tx, rx) = oneshot::channel();
            queue.push_back(WaitEntry {
                deadline: Instant::now() + self.inner.config.max_wait,
                notify: tx,
            });
            rx
        };

        match rx.await {
            Ok(permit) => Ok(Ticket { permit: Some(permit) }),
            Err(_) if self.inner.is_closed() => Err(CorralError::Shutdown),
            Err(_) => Err(CorralError::Capacity),
        }
    }

    /// Runs `operation` while holding a ticket.
    pub async fn run<F, T>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _ticket = self.acquire().await?;
        operation.await
    }

    /// Free tickets. Always `0` for a disabled controller.
    pub fn available(&self) -> usize {
        self.inner.tickets.available_permits()
    }

    /// Callers currently parked in the wait queue.
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Stops issuing tickets and fails every parked waiter.
    pub fn close(&self) {
        self.inner.close();
    }
}

async fn sweep_loop(inner: Weak<Inner>, interval: Duration, shutdown: Shutdown) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                if let Some(inner) = inner.upgrade() {
                    inner.close();
                }
                return;
            }
            _ = ticker.tick() => {}
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        if std::panic::catch_unwind(AssertUnwindSafe(|| inner.sweep())).is_err() {
            tracing::error!("admission sweep panicked, continuing");
        }
    }
}
