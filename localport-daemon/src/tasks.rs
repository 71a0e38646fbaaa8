//! Registry of long-lived cooperative tasks
//!
//! Every background loop (health monitors, cluster pollers, the log
//! sweeper) registers here with a name, a priority, a cancellation token,
//! and its join handle. Shutdown cancels in descending priority order and
//! bounds the wait; a task that ignores its token gets aborted and logged
//! as a leak.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cancelled first during shutdown
pub const PRIORITY_HEALTH: u8 = 30;
pub const PRIORITY_CLUSTER: u8 = 20;
/// Cancelled last
pub const PRIORITY_MAINTENANCE: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

struct TaskEntry {
    name: String,
    priority: u8,
    tags: Vec<String>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Snapshot row for diagnostics
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub name: String,
    pub priority: u8,
    pub tags: Vec<String>,
    pub finished: bool,
}

/// Counts work that is actually mid-flight (a probe on the wire, a
/// reconcile in progress) as opposed to tasks sleeping between cycles.
/// Shutdown's Drain phase waits for this to reach zero before cancelling
/// anything.
#[derive(Default)]
pub struct ActivityTracker {
    active: AtomicU64,
}

impl ActivityTracker {
    pub fn begin(&self) -> ActivityGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActivityGuard { tracker: self }
    }

    pub fn in_flight(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until nothing is in flight, up to `deadline`
    pub async fn drain(&self, deadline: Duration) -> bool {
        let end = tokio::time::Instant::now() + deadline;
        while self.in_flight() > 0 {
            if tokio::time::Instant::now() >= end {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }
}

/// RAII guard for one unit of in-flight work
pub struct ActivityGuard<'a> {
    tracker: &'a ActivityTracker,
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<u64, TaskEntry>>,
    next_id: AtomicU64,
    activity: std::sync::Arc<ActivityTracker>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared in-flight work counter for tasks registered here
    pub fn activity(&self) -> std::sync::Arc<ActivityTracker> {
        std::sync::Arc::clone(&self.activity)
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        priority: u8,
        tags: Vec<String>,
        token: CancellationToken,
        handle: JoinHandle<()>,
    ) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        debug!("Registered task {} (priority {})", name, priority);
        self.tasks.lock().insert(
            id,
            TaskEntry {
                name,
                priority,
                tags,
                token,
                handle,
            },
        );
        TaskId(id)
    }

    pub fn list(&self) -> Vec<TaskInfo> {
        self.tasks
            .lock()
            .values()
            .map(|entry| TaskInfo {
                name: entry.name.clone(),
                priority: entry.priority,
                tags: entry.tags.clone(),
                finished: entry.handle.is_finished(),
            })
            .collect()
    }

    /// Cancel every task carrying the tag and drop it from the registry.
    /// Fire-and-forget: the tasks observe their tokens at the next yield.
    pub fn cancel_by_tag(&self, tag: &str) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, entry| {
            if entry.tags.iter().any(|t| t == tag) {
                debug!("Cancelling task {} (tag {})", entry.name, tag);
                entry.token.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Cancel every task in the given priority band and drop it from the
    /// registry. Fire-and-forget, like `cancel_by_tag`.
    pub fn cancel_by_priority(&self, band: u8) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, entry| {
            if entry.priority == band {
                debug!("Cancelling task {} (priority band {})", entry.name, band);
                entry.token.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Drop entries whose tasks already finished on their own
    pub fn prune_finished(&self) {
        self.tasks.lock().retain(|_, entry| !entry.handle.is_finished());
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Wait (up to `deadline`) for every registered task to finish on its
    /// own (the shutdown Drain phase). Nothing is cancelled.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let end = tokio::time::Instant::now() + deadline;
        loop {
            self.prune_finished();
            if self.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= end {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Cancel everything in descending priority order and await completion
    /// within `deadline`. Returns the names of tasks that had to be
    /// abandoned (aborted).
    pub async fn cancel_all(&self, deadline: Duration) -> Vec<String> {
        let mut entries: Vec<TaskEntry> = {
            let mut tasks = self.tasks.lock();
            tasks.drain().map(|(_, entry)| entry).collect()
        };
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));

        for entry in &entries {
            entry.token.cancel();
        }

        let end = tokio::time::Instant::now() + deadline;
        let mut leaked = Vec::new();

        for mut entry in entries {
            let remaining = end.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, &mut entry.handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("Task {} did not exit within deadline, abandoning", entry.name);
                    entry.handle.abort();
                    leaked.push(entry.name);
                }
            }
        }

        leaked
    }
}
