use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::info;

/// Shared switches for the refresh worker: kill-switch, run lock, startup
/// readiness and the recurring trigger tasks.
pub struct WorkerState {
    enabled: AtomicBool,
    running: AtomicBool,
    ready: AtomicBool,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            running: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip the kill-switch; returns the new value.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!("Price worker {}", if enabled { "enabled" } else { "disabled" });
        }
        enabled
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Take the run lock without waiting. `None` means a run is in flight.
    pub fn try_lock(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard { state: self })
    }

    pub fn add_jobs(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(handles);
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Abort every recurring trigger. In-flight runs are separate tasks and finish.
    pub fn cancel_jobs(&self) -> usize {
        let jobs: Vec<_> = self
            .jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for job in &jobs {
            job.abort();
        }
        jobs.len()
    }
}

/// Held for the duration of one run; dropping it releases the lock.
pub struct RunGuard<'a> {
    state: &'a WorkerState,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
    }
}
