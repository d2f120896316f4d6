//! Timeout scheduler.
//!
//! # Responsibilities
//! - Track the armed deadline of each suspended request
//! - Fire the request's timeout path at (or shortly after) its deadline
//! - Accept insert/replace/remove from any thread without blocking
//!
//! # Design Decisions
//! - A single tokio task owns a min-heap of entries; callers talk to it over
//!   an unbounded channel, so no lock is shared with worker threads
//! - Every armed deadline gets a process-unique generation, which is the
//!   removal key; request IDs come from clients and may repeat
//! - Removal is lazy: the task keeps the set of live generations and discards
//!   heap entries that are no longer in it
//! - Each firing runs on its own task so a slow timeout handler never delays
//!   other deadlines

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::suspend::context::RequestId;
use crate::suspend::error::SuspendError;

/// Longest delay a deadline is armed with. Longer delays are clamped.
pub const MAX_DELAY: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Deadline `after` from now, clamped to [`MAX_DELAY`].
pub fn deadline_after(after: Duration) -> Instant {
    Instant::now() + after.min(MAX_DELAY)
}

/// Something that can be timed out.
pub trait Expire: Send + Sync + 'static {
    /// Request this target belongs to.
    fn request_id(&self) -> RequestId;

    /// Called once the deadline armed with `generation` has passed.
    fn expire(self: Arc<Self>, generation: u64);
}

/// A deadline registered for one request.
pub struct TimeoutEntry {
    target: Arc<dyn Expire>,
    deadline: Instant,
    generation: u64,
}

impl TimeoutEntry {
    pub fn new(target: Arc<dyn Expire>, deadline: Instant, generation: u64) -> Self {
        Self {
            target,
            deadline,
            generation,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for TimeoutEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutEntry")
            .field("request_id", &self.target.request_id())
            .field("deadline", &self.deadline)
            .field("generation", &self.generation)
            .finish()
    }
}

impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for TimeoutEntry {}

impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline on top.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

enum Command {
    Schedule(TimeoutEntry),
    Cancel(u64),
    Stop,
}

/// Entry point of the scheduler lifecycle.
pub struct TimeoutScheduler;

impl TimeoutScheduler {
    /// Spawn the scheduler task on the current tokio runtime.
    pub fn start() -> SchedulerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicU64::new(0));

        tokio::spawn(run(rx, pending.clone(), fired.clone()));
        tracing::debug!("Timeout scheduler started");

        SchedulerHandle {
            tx,
            pending,
            fired,
            next_generation: Arc::new(AtomicU64::new(1)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Cloneable handle used to register and remove deadlines.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
    pending: Arc<AtomicUsize>,
    fired: Arc<AtomicU64>,
    next_generation: Arc<AtomicU64>,
    /// Set by `stop` before the task has drained its queue.
    stopped: Arc<AtomicBool>,
}

impl SchedulerHandle {
    /// Allocate a generation number. Never returns 0.
    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a deadline.
    pub fn schedule(&self, entry: TimeoutEntry) -> Result<(), SuspendError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SuspendError::SchedulerStopped);
        }
        self.tx
            .send(Command::Schedule(entry))
            .map_err(|_| SuspendError::SchedulerStopped)
    }

    /// Convenience wrapper computing the deadline from now.
    pub fn schedule_in(
        &self,
        target: Arc<dyn Expire>,
        after: Duration,
        generation: u64,
    ) -> Result<(), SuspendError> {
        self.schedule(TimeoutEntry::new(target, deadline_after(after), generation))
    }

    /// Remove the deadline armed with `generation`, if it has not fired yet.
    pub fn cancel(&self, generation: u64) {
        // A stopped scheduler fires nothing, so there is nothing left to remove.
        let _ = self.tx.send(Command::Cancel(generation));
    }

    /// Remove `previous` (0 for none) and insert `entry` in its place.
    pub fn replace(&self, previous: u64, entry: TimeoutEntry) -> Result<(), SuspendError> {
        if previous != 0 {
            self.cancel(previous);
        }
        self.schedule(entry)
    }

    /// Stop the scheduler task. Pending deadlines are dropped without firing.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if self.tx.send(Command::Stop).is_ok() {
            tracing::debug!("Timeout scheduler stopping");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    /// Number of live (not superseded, not removed) deadlines.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Total number of deadlines that fired.
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Command>,
    pending: Arc<AtomicUsize>,
    fired: Arc<AtomicU64>,
) {
    let mut heap: BinaryHeap<TimeoutEntry> = BinaryHeap::new();
    let mut live: HashSet<u64> = HashSet::new();

    loop {
        let next_deadline = heap.peek().map(TimeoutEntry::deadline);

        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Schedule(entry)) => {
                    live.insert(entry.generation);
                    heap.push(entry);
                }
                Some(Command::Cancel(generation)) => {
                    live.remove(&generation);
                }
                Some(Command::Stop) | None => break,
            },
            _ = sleep_until(next_deadline) => {
                let now = Instant::now();
                while heap.peek().is_some_and(|entry| entry.deadline <= now) {
                    let Some(entry) = heap.pop() else { break };
                    if !live.remove(&entry.generation) {
                        continue;
                    }
                    let id = entry.target.request_id();
                    fired.fetch_add(1, Ordering::Relaxed);

                    let lateness = now.saturating_duration_since(entry.deadline);
                    tracing::trace!(request_id = %id, late_ms = u64::try_from(lateness.as_millis()).unwrap_or(u64::MAX), "Deadline reached");
                    tokio::spawn(async move {
                        entry.target.expire(entry.generation);
                    });
                }
            }
        }

        // Superseded entries stay in the heap until popped; compact when they dominate.
        if heap.len() > 64 && heap.len() > live.len() * 4 {
            heap.retain(|entry| live.contains(&entry.generation));
        }
        pending.store(live.len(), Ordering::Relaxed);
    }

    pending.store(0, Ordering::Relaxed);
    tracing::debug!(dropped = live.len(), "Timeout scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        id: RequestId,
        fired: Mutex<Vec<u64>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: RequestId::new(),
                fired: Mutex::new(Vec::new()),
            })
        }

        fn fired(&self) -> Vec<u64> {
            self.fired.lock().unwrap().clone()
        }
    }

    impl Expire for Recorder {
        fn request_id(&self) -> RequestId {
            self.id
        }

        fn expire(self: Arc<Self>, generation: u64) {
            self.fired.lock().unwrap().push(generation);
        }
    }

    #[tokio::test]
    async fn fires_after_deadline() {
        let scheduler = TimeoutScheduler::start();
        let recorder = Recorder::new();
        let generation = scheduler.next_generation();

        let start = Instant::now();
        scheduler
            .schedule_in(recorder.clone(), Duration::from_millis(50), generation)
            .unwrap();

        time::sleep(Duration::from_millis(20)).await;
        assert!(recorder.fired().is_empty());

        time::sleep(Duration::from_millis(80)).await;
        assert_eq!(recorder.fired(), vec![generation]);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.fired(), 1);
    }

    #[tokio::test]
    async fn replacement_supersedes_earlier_deadline() {
        let scheduler = TimeoutScheduler::start();
        let recorder = Recorder::new();

        let first = scheduler.next_generation();
        scheduler
            .schedule_in(recorder.clone(), Duration::from_millis(30), first)
            .unwrap();
        let second = scheduler.next_generation();
        scheduler
            .replace(
                first,
                TimeoutEntry::new(recorder.clone(), Instant::now() + Duration::from_millis(120), second),
            )
            .unwrap();

        time::sleep(Duration::from_millis(70)).await;
        assert!(recorder.fired().is_empty(), "stale deadline must not fire");

        time::sleep(Duration::from_millis(120)).await;
        assert_eq!(recorder.fired(), vec![second]);
    }

    #[tokio::test]
    async fn cancel_removes_deadline() {
        let scheduler = TimeoutScheduler::start();
        let recorder = Recorder::new();
        let generation = scheduler.next_generation();

        scheduler
            .schedule_in(recorder.clone(), Duration::from_millis(40), generation)
            .unwrap();
        scheduler.cancel(generation);

        time::sleep(Duration::from_millis(100)).await;
        assert!(recorder.fired().is_empty());
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn fires_in_deadline_order() {
        let scheduler = TimeoutScheduler::start();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Ordered {
            id: RequestId,
            label: u64,
            order: Arc<Mutex<Vec<u64>>>,
        }
        impl Expire for Ordered {
            fn request_id(&self) -> RequestId {
                self.id
            }
            fn expire(self: Arc<Self>, _generation: u64) {
                self.order.lock().unwrap().push(self.label);
            }
        }

        for (label, ms) in [(3u64, 90u64), (1, 10), (2, 50)] {
            let target = Arc::new(Ordered {
                id: RequestId::new(),
                label,
                order: order.clone(),
            });
            scheduler
                .schedule_in(target, Duration::from_millis(ms), scheduler.next_generation())
                .unwrap();
        }

        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stopped_scheduler_rejects_new_deadlines() {
        let scheduler = TimeoutScheduler::start();
        let recorder = Recorder::new();
        scheduler
            .schedule_in(recorder.clone(), Duration::from_millis(30), scheduler.next_generation())
            .unwrap();

        scheduler.stop();
        time::sleep(Duration::from_millis(60)).await;

        assert!(!scheduler.is_running());
        assert!(recorder.fired().is_empty());
        let err = scheduler
            .schedule_in(recorder, Duration::from_millis(10), scheduler.next_generation())
            .unwrap_err();
        assert_eq!(err, SuspendError::SchedulerStopped);
    }

    #[tokio::test]
    async fn schedule_from_plain_threads() {
        let scheduler = TimeoutScheduler::start();
        let recorders: Vec<_> = (0..8).map(|_| Recorder::new()).collect();

        let threads: Vec<_> = recorders
            .iter()
            .cloned()
            .map(|recorder| {
                let scheduler = scheduler.clone();
                std::thread::spawn(move || {
                    let generation = scheduler.next_generation();
                    scheduler
                        .schedule_in(recorder, Duration::from_millis(20), generation)
                        .unwrap();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        time::sleep(Duration::from_millis(100)).await;
        assert!(recorders.iter().all(|p| p.fired().len() == 1));
    }

    #[tokio::test]
    async fn stop_rejects_deadlines_immediately() {
        let scheduler = TimeoutScheduler::start();
        scheduler.stop();

        assert!(!scheduler.is_running());
        let err = scheduler
            .schedule_in(Recorder::new(), Duration::from_millis(10), scheduler.next_generation())
            .unwrap_err();
        assert_eq!(err, SuspendError::SchedulerStopped);
    }

    #[tokio::test]
    async fn huge_delay_is_clamped() {
        let scheduler = TimeoutScheduler::start();
        let recorder = Recorder::new();
        let generation = scheduler.next_generation();

        scheduler
            .schedule_in(recorder.clone(), Duration::MAX, generation)
            .unwrap();
        assert!(deadline_after(Duration::MAX) <= Instant::now() + MAX_DELAY);

        time::sleep(Duration::from_millis(20)).await;
        assert!(recorder.fired().is_empty());
        assert_eq!(scheduler.pending(), 1);
    }
}
