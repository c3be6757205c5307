//! Periodic task scheduling.
//!
//! The replication bus does not own a timer; it asks a [`Scheduler`] to run its
//! poll tick at a fixed interval. [`ThreadScheduler`] runs each task on its own
//! background thread. [`ManualScheduler`] lets a host drive ticks from its own
//! loop (and lets tests tick deterministically).

use crate::error::{Result, StorageError};
use crossbeam_channel::{bounded, RecvTimeoutError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A repeating unit of work.
pub type Task = Box<dyn FnMut() + Send + 'static>;

/// Runs callbacks repeatedly at a fixed interval.
pub trait Scheduler: Send + Sync {
    fn schedule_periodic(&self, interval: Duration, task: Task) -> Result<TaskHandle>;
}

/// Cancels a scheduled task when [`cancel`](TaskHandle::cancel)ed or dropped.
///
/// A tick already running is allowed to finish.
pub struct TaskHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TaskHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_none()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// One background thread per scheduled task.
#[derive(Clone, Debug)]
pub struct ThreadScheduler {
    thread_name: String,
}

impl ThreadScheduler {
    pub fn new(thread_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
        }
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new("sqlmirror-poll")
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_periodic(&self, interval: Duration, mut task: Task) -> Result<TaskHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => task(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| StorageError::Scheduler(e.to_string()))?;

        // Dropping the sender disconnects the channel and ends the loop.
        Ok(TaskHandle::new(move || drop(stop_tx)))
    }
}

struct ManualTask {
    cancelled: Arc<AtomicBool>,
    task: Task,
}

/// Runs every scheduled task once per [`tick`](ManualScheduler::tick).
///
/// Intervals are ignored; the caller's tick cadence is the interval.
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<Vec<ManualTask>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run all live tasks once. Returns how many ran.
    pub fn tick(&self) -> usize {
        // Run outside the lock so a task may schedule more work.
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        tasks.retain(|t| !t.cancelled.load(Ordering::SeqCst));

        let mut ran = 0;
        for entry in tasks.iter_mut() {
            if !entry.cancelled.load(Ordering::SeqCst) {
                (entry.task)();
                ran += 1;
            }
        }

        let mut guard = self.tasks.lock();
        let added = std::mem::take(&mut *guard);
        *guard = tasks;
        guard.extend(added);
        ran
    }

    pub fn task_count(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_periodic(&self, _interval: Duration, task: Task) -> Result<TaskHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.tasks.lock().push(ManualTask {
            cancelled: Arc::clone(&cancelled),
            task,
        });
        Ok(TaskHandle::new(move || cancelled.store(true, Ordering::SeqCst)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn test_thread_scheduler_runs_and_cancels() {
        let scheduler = ThreadScheduler::default();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let mut handle = scheduler
            .schedule_periodic(
                Duration::from_millis(5),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(count.load(Ordering::SeqCst) >= 3);

        handle.cancel();
        assert!(handle.is_cancelled());
        thread::sleep(Duration::from_millis(30));
        let after_cancel = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn test_manual_scheduler_tick() {
        let scheduler = ManualScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let handle = scheduler
            .schedule_periodic(
                Duration::from_secs(1),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert_eq!(scheduler.tick(), 1);
        assert_eq!(scheduler.tick(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        drop(handle);
        assert_eq!(scheduler.tick(), 0);
        assert_eq!(scheduler.task_count(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
