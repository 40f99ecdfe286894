//! Repeating-task scheduling for the auto-pump.
//!
//! The client never owns a timer thread. It asks an injected
//! [`PumpScheduler`] to fire its drain task at a fixed interval, and hosts
//! that already have a run loop implement the trait over it. For hosts
//! without one, [`RunLoop`] is a cooperative scheduler driven by calling
//! [`RunLoop::run_pending`] from the host's main loop.

use std::cell::RefCell;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::Error;

/// Interval between auto-pump firings.
pub(crate) const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// Token identifying one scheduled repeating task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PumpToken(u64);

impl PumpToken {
    /// Build a token from a raw value. Scheduler implementations mint
    /// these; each live task needs a distinct value.
    pub fn from_raw(raw: u64) -> Self {
        PumpToken(raw)
    }

    pub fn into_raw(self) -> u64 {
        self.0
    }
}

/// A scheduled repeating task.
pub type PumpTask = Box<dyn FnMut()>;

/// Repeating-task scheduler the client arms its auto-pump through.
///
/// Implementations must fire tasks on the same thread the client lives on;
/// the whole engine is single-threaded cooperative.
pub trait PumpScheduler {
    /// Register `task` to fire every `interval` until cancelled. The first
    /// firing happens one interval after registration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] when the scheduler cannot take
    /// another task.
    fn schedule(&self, interval: Duration, task: PumpTask) -> Result<PumpToken, Error>;

    /// Stop a previously scheduled task. Unknown tokens are ignored;
    /// cancelling from inside the running task itself takes effect after
    /// the current firing.
    fn cancel(&self, token: PumpToken);
}

struct Scheduled {
    token: PumpToken,
    interval: Duration,
    due: Instant,
    task: PumpTask,
}

#[derive(Default)]
struct RunLoopState {
    next_token: u64,
    tasks: Vec<Scheduled>,
    /// Token of the task currently being fired, if any.
    running: Option<PumpToken>,
    /// Set when the running task was cancelled mid-firing.
    cancel_running: bool,
}

/// Cooperative single-threaded scheduler.
///
/// The host calls [`RunLoop::run_pending`] from its own loop; every task
/// whose interval has elapsed fires once per call, on the caller's thread.
/// Tasks may schedule and cancel (including themselves) while firing.
///
/// # Example
///
/// ```ignore
/// let scheduler = Rc::new(RunLoop::new());
/// let client = Client::connect(&directory, scheduler.clone())?;
/// client.subscribe_with(&["window_moved"], on_moved)?;
///
/// loop {
///     scheduler.run_pending();
///     // ... the host's own work ...
/// }
/// ```
#[derive(Default)]
pub struct RunLoop {
    state: RefCell<RunLoopState>,
}

impl RunLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live scheduled tasks.
    pub fn task_count(&self) -> usize {
        self.state.borrow().tasks.len()
    }

    /// Time until the next task is due, when any is scheduled. A zero
    /// duration means a task is due right now.
    pub fn next_due(&self) -> Option<Duration> {
        let now = Instant::now();
        self.state
            .borrow()
            .tasks
            .iter()
            .map(|scheduled| scheduled.due.saturating_duration_since(now))
            .min()
    }

    /// Fire every task that is due, earliest first, and return how many
    /// fired. Each due task fires exactly once per call, so a task that
    /// stays due cannot starve the host.
    pub fn run_pending(&self) -> usize {
        if self.state.borrow().running.is_some() {
            // Re-entered from inside a task; the outer call keeps draining.
            return 0;
        }

        let started = Instant::now();
        let mut fired = 0;
        loop {
            let mut entry = {
                let mut state = self.state.borrow_mut();
                let due_index = state
                    .tasks
                    .iter()
                    .enumerate()
                    .filter(|(_, scheduled)| scheduled.due <= started)
                    .min_by_key(|(_, scheduled)| scheduled.due)
                    .map(|(index, _)| index);
                let Some(index) = due_index else { break };
                let entry = state.tasks.remove(index);
                state.running = Some(entry.token);
                state.cancel_running = false;
                entry
            };

            (entry.task)();
            fired += 1;

            let mut state = self.state.borrow_mut();
            state.running = None;
            if state.cancel_running {
                state.cancel_running = false;
            } else {
                entry.due = Instant::now() + entry.interval;
                state.tasks.push(entry);
            }
        }
        fired
    }
}

impl PumpScheduler for RunLoop {
    fn schedule(&self, interval: Duration, task: PumpTask) -> Result<PumpToken, Error> {
        let mut state = self.state.borrow_mut();
        state.next_token += 1;
        let token = PumpToken::from_raw(state.next_token);
        state.tasks.push(Scheduled {
            token,
            interval,
            due: Instant::now() + interval,
            task,
        });
        debug!(
            token = token.into_raw(),
            interval_ms = interval.as_millis() as u64,
            "repeating task scheduled"
        );
        Ok(token)
    }

    fn cancel(&self, token: PumpToken) {
        let mut state = self.state.borrow_mut();
        if state.running == Some(token) {
            state.cancel_running = true;
        } else {
            state.tasks.retain(|scheduled| scheduled.token != token);
        }
        debug!(token = token.into_raw(), "repeating task cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::thread;

    const TICK: Duration = Duration::from_millis(2);

    fn counting_task(counter: &Rc<Cell<usize>>) -> PumpTask {
        let counter = Rc::clone(counter);
        Box::new(move || counter.set(counter.get() + 1))
    }

    #[test]
    fn test_task_does_not_fire_before_interval() {
        let scheduler = RunLoop::new();
        let counter = Rc::new(Cell::new(0));
        scheduler
            .schedule(Duration::from_secs(60), counting_task(&counter))
            .expect("schedule failed");

        assert_eq!(scheduler.run_pending(), 0);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_task_fires_after_interval_and_repeats() {
        let scheduler = RunLoop::new();
        let counter = Rc::new(Cell::new(0));
        scheduler
            .schedule(TICK, counting_task(&counter))
            .expect("schedule failed");

        thread::sleep(TICK * 2);
        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(counter.get(), 1);

        thread::sleep(TICK * 2);
        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_each_due_task_fires_once_per_run() {
        let scheduler = RunLoop::new();
        let counter = Rc::new(Cell::new(0));
        scheduler
            .schedule(TICK, counting_task(&counter))
            .expect("schedule failed");
        scheduler
            .schedule(TICK, counting_task(&counter))
            .expect("schedule failed");

        thread::sleep(TICK * 2);
        assert_eq!(scheduler.run_pending(), 2);
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_cancel_prevents_future_firings() {
        let scheduler = RunLoop::new();
        let counter = Rc::new(Cell::new(0));
        let token = scheduler
            .schedule(TICK, counting_task(&counter))
            .expect("schedule failed");

        scheduler.cancel(token);
        thread::sleep(TICK * 2);
        assert_eq!(scheduler.run_pending(), 0);
        assert_eq!(counter.get(), 0);
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn test_cancel_unknown_token_is_ignored() {
        let scheduler = RunLoop::new();
        scheduler.cancel(PumpToken::from_raw(999));
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn test_task_can_cancel_itself_while_firing() {
        let scheduler = Rc::new(RunLoop::new());
        let token_cell: Rc<Cell<Option<PumpToken>>> = Rc::new(Cell::new(None));
        let counter = Rc::new(Cell::new(0));

        let task = {
            let scheduler = Rc::clone(&scheduler);
            let token_cell = Rc::clone(&token_cell);
            let counter = Rc::clone(&counter);
            Box::new(move || {
                counter.set(counter.get() + 1);
                if let Some(token) = token_cell.get() {
                    scheduler.cancel(token);
                }
            })
        };
        let token = scheduler.schedule(TICK, task).expect("schedule failed");
        token_cell.set(Some(token));

        thread::sleep(TICK * 2);
        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(counter.get(), 1);
        assert_eq!(scheduler.task_count(), 0);

        thread::sleep(TICK * 2);
        assert_eq!(scheduler.run_pending(), 0);
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn test_next_due_reports_nearest_deadline() {
        let scheduler = RunLoop::new();
        assert!(scheduler.next_due().is_none());

        scheduler
            .schedule(Duration::from_secs(60), Box::new(|| {}))
            .expect("schedule failed");
        let due = scheduler.next_due().expect("no deadline");
        assert!(due <= Duration::from_secs(60));
        assert!(due > Duration::from_secs(59));
    }
}
