//! Self-rearming activation timer.
//!
//! The timer decides, on every fire, whether the watch window is open. Each
//! fire looks at the clock again rather than trusting the previously
//! computed deadline, so a suspended machine or a skewed clock is absorbed
//! on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::ScheduleError;
use crate::schedule::{Occurrence, ScheduleEvaluator};

/// Delay used when the timer should fire as soon as possible.
pub const PROMPT_DELAY: Duration = Duration::from_millis(1);

/// Source of the current time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Whether the watch window is currently open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationState {
    #[default]
    Idle,
    Watching,
}

/// A change of [`ActivationState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The window opened.
    Activate,

    /// The window closed.
    Deactivate,
}

impl ActivationState {
    /// Next state given whether the upcoming occurrence is continuous.
    pub fn step(self, continuous: bool) -> (Self, Option<Transition>) {
        match (self, continuous) {
            (Self::Idle, true) => (Self::Watching, Some(Transition::Activate)),
            (Self::Watching, false) => (Self::Idle, Some(Transition::Deactivate)),
            (state, _) => (state, None),
        }
    }

    pub fn is_watching(self) -> bool {
        self == Self::Watching
    }
}

/// Receives timer output. Called on the timer task; the next delay is not
/// computed until the call returns.
pub trait TransitionSink: Send + Sync + 'static {
    /// The window opened or closed. `next` is the occurrence that decided it.
    fn on_transition(&self, transition: Transition, next: &Occurrence);

    /// The schedule could not be evaluated; the timer has stopped.
    fn on_error(&self, error: ScheduleError) {
        error!("activation timer stopped: {error}");
    }
}

/// Handle to a running activation timer. Dropping it cancels the timer.
pub struct ActivationTimer {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    state: watch::Receiver<ActivationState>,
}

impl ActivationTimer {
    /// Evaluate the schedule and arm the first fire.
    ///
    /// The first fire is immediate when the upcoming occurrence is part of
    /// a continuous run, otherwise it waits for that occurrence. No single
    /// sleep exceeds `max_tick`.
    pub fn start(
        evaluator: ScheduleEvaluator,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn TransitionSink>,
        max_tick: Duration,
    ) -> Result<Self, ScheduleError> {
        let max_tick = max_tick.max(PROMPT_DELAY);
        let now = clock.now();
        let next = evaluator.next_occurrence(now)?;
        let initial = if evaluator.is_continuous(&next) {
            PROMPT_DELAY
        } else {
            delay_until(now, &next, max_tick)
        };
        debug!(
            "activation timer armed for {}, first check in {initial:?}",
            next.local
        );

        let (state_tx, state) = watch::channel(ActivationState::Idle);
        let cancel = CancellationToken::new();
        let ticker = Ticker {
            evaluator,
            clock,
            sink,
            max_tick,
            state: ActivationState::Idle,
            state_tx,
        };
        let task = tokio::spawn(ticker.run(initial, cancel.clone()));

        Ok(Self {
            cancel,
            task: Some(task),
            state,
        })
    }

    /// Current state.
    pub fn state(&self) -> ActivationState {
        *self.state.borrow()
    }

    /// Cancel the timer and wait for an in-flight fire to finish. No
    /// transition is delivered after this returns. Calling it twice is fine.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("activation timer task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for ActivationTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Ticker {
    evaluator: ScheduleEvaluator,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TransitionSink>,
    max_tick: Duration,
    state: ActivationState,
    state_tx: watch::Sender<ActivationState>,
}

impl Ticker {
    async fn run(mut self, mut delay: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            match self.fire() {
                Ok(next_delay) => delay = next_delay,
                Err(e) => {
                    self.sink.on_error(e);
                    return;
                }
            }
        }
    }

    fn fire(&mut self) -> Result<Duration, ScheduleError> {
        let now = self.clock.now();
        let next = self.evaluator.next_occurrence(now)?;
        let continuous = self.evaluator.is_continuous(&next);

        let (state, transition) = self.state.step(continuous);
        self.state = state;
        if let Some(transition) = transition {
            debug!("timer transition {transition:?} at {now}, next occurrence {}", next.local);
            self.sink.on_transition(transition, &next);
            self.state_tx.send_replace(state);
        }

        Ok(delay_until(now, &next, self.max_tick))
    }
}

fn delay_until(now: DateTime<Utc>, next: &Occurrence, max_tick: Duration) -> Duration {
    (next.utc - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .clamp(PROMPT_DELAY, max_tick)
}
