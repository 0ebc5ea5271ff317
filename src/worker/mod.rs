//! Recurring triggers for the refresh task.
//!
//! Two triggers run alongside an eager startup run:
//! - every `interval` while the session window is open;
//! - once at each session open, so the first tick of the day is never lost to
//!   interval drift.
//!
//! Each firing spawns its own run task. Cancelling the triggers therefore stops
//! future firings without touching a run that is already going.

mod state;

pub use self::state::{RunGuard, WorkerState};

use crate::freshness::{Clock, MarketSession};
use crate::pipeline::{RefreshTask, RunOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::{debug, info, warn};

pub struct Scheduler {
    task: Arc<dyn RefreshTask>,
    state: Arc<WorkerState>,
    session: MarketSession,
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(
        task: Arc<dyn RefreshTask>,
        state: Arc<WorkerState>,
        session: MarketSession,
        interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            task,
            state,
            session,
            interval,
            clock,
        }
    }

    /// Fire the startup run, register both triggers, then mark the worker ready.
    pub fn start(&self) -> JoinHandle<RunOutcome> {
        let startup = fire(&self.task, "startup");

        let every = tokio::spawn(interval_trigger(
            Arc::clone(&self.task),
            self.session.clone(),
            self.interval,
            Arc::clone(&self.clock),
        ));
        let at_open = tokio::spawn(open_trigger(
            Arc::clone(&self.task),
            self.session.clone(),
            Arc::clone(&self.clock),
        ));
        self.state.add_jobs([every, at_open]);
        self.state.mark_ready();

        info!(
            "Scheduler started: every {:?} between {} and {} UTC on {:?}",
            self.interval, self.session.open, self.session.close, self.session.weekdays
        );
        startup
    }

    /// Stop future firings and release the task's long-lived handles.
    pub fn shutdown(&self) {
        let n = self.state.cancel_jobs();
        self.task.close();
        info!("Scheduler stopped ({} triggers cancelled)", n);
    }
}

fn fire(task: &Arc<dyn RefreshTask>, reason: &'static str) -> JoinHandle<RunOutcome> {
    let task = Arc::clone(task);
    tokio::spawn(async move {
        debug!("Refresh fired by {} trigger", reason);
        let outcome = task.run().await;
        debug!("{} run finished: {:?}", reason, outcome);
        outcome
    })
}

async fn interval_trigger(
    task: Arc<dyn RefreshTask>,
    session: MarketSession,
    period: Duration,
    clock: Arc<dyn Clock>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !session.is_open(clock.now()) {
            debug!("Interval tick outside session window");
            continue;
        }
        fire(&task, "interval");
    }
}

async fn open_trigger(task: Arc<dyn RefreshTask>, session: MarketSession, clock: Arc<dyn Clock>) {
    loop {
        let now = clock.now();
        let Some(next) = session.next_open(now) else {
            warn!("Session has no trading days; open trigger idle");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        debug!("Next session open at {} (in {:?})", next, wait);
        sleep(wait).await;
        fire(&task, "session-open");
    }
}
