use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::playback::Playback;
use crate::state::EngineState;

/// Cadence tunables for the poll loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleConfig {
    /// Delay before the very first cycle.
    pub startup_delay: Duration,
    /// Delay while nothing is actively playing.
    pub idle_interval: Duration,
    /// Base delay while a track is playing.
    pub playing_interval: Duration,
    /// Ceiling for the delay while the same track keeps playing.
    pub max_playing_interval: Duration,
    /// Per-cycle multiplier while the same track keeps playing (1.0 disables).
    pub playing_growth: f64,
    /// Per-failure multiplier during backoff.
    pub backoff_growth: f64,
    /// Ceiling for the backoff delay.
    pub max_backoff: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(5),
            idle_interval: Duration::from_secs(15),
            playing_interval: Duration::from_secs(5),
            max_playing_interval: Duration::from_secs(15),
            playing_growth: 1.25,
            backoff_growth: 2.0,
            max_backoff: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// What a finished cycle reports back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Success(Playback),
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleState {
    pub last_outcome: Outcome,
    /// `None` until the first successful observation.
    pub last_state: Option<Playback>,
    pub consecutive_failures: u32,
    pub current_delay: Duration,
}

/// Chooses the delay before the next cycle from the outcome of the last one.
#[derive(Debug, Clone)]
pub struct Scheduler {
    config: ScheduleConfig,
    state: ScheduleState,
    // Delay in effect when the current failure streak started.
    backoff_base: Duration,
}

impl Scheduler {
    pub fn new(config: ScheduleConfig) -> Self {
        Self {
            config,
            state: ScheduleState {
                last_outcome: Outcome::Success,
                last_state: None,
                consecutive_failures: 0,
                current_delay: config.startup_delay,
            },
            backoff_base: config.startup_delay,
        }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    pub fn state(&self) -> &ScheduleState {
        &self.state
    }

    pub fn current_delay(&self) -> Duration {
        self.state.current_delay
    }

    /// Record a finished cycle and return the delay before the next one.
    pub fn record(&mut self, outcome: CycleOutcome) -> Duration {
        let delay = match outcome {
            CycleOutcome::Success(playback) => {
                let delay = self.success_delay(&playback);
                self.state.last_outcome = Outcome::Success;
                self.state.last_state = Some(playback);
                self.state.consecutive_failures = 0;
                delay
            }
            CycleOutcome::Failure => {
                if self.state.consecutive_failures == 0 {
                    self.backoff_base = self.state.current_delay;
                }
                self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
                self.state.last_outcome = Outcome::Failure;
                backoff_delay(
                    self.backoff_base,
                    self.config.backoff_growth,
                    self.state.consecutive_failures,
                    self.config.max_backoff,
                )
            }
        };
        self.state.current_delay = delay;
        delay
    }

    fn success_delay(&self, playback: &Playback) -> Duration {
        let Some(track_id) = playback.is_active().then(|| playback.track_id()).flatten() else {
            return self.config.idle_interval;
        };

        let same_track = self.state.last_outcome == Outcome::Success
            && self
                .state
                .last_state
                .as_ref()
                .is_some_and(|last| last.is_active() && last.track_id() == Some(track_id));

        let base = self.config.playing_interval;
        if !same_track {
            return base;
        }
        let ceiling = self.config.max_playing_interval.max(base);
        scale(self.state.current_delay, self.config.playing_growth, ceiling).max(base)
    }
}

/// `min(base * growth^failures, max)`, saturating instead of overflowing.
pub fn backoff_delay(base: Duration, growth: f64, failures: u32, max: Duration) -> Duration {
    let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
    scale(base, growth.powi(exponent), max)
}

fn scale(delay: Duration, factor: f64, ceiling: Duration) -> Duration {
    let secs = delay.as_secs_f64() * factor;
    if !secs.is_finite() || secs >= ceiling.as_secs_f64() {
        ceiling
    } else {
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// One fetch-then-reconcile pass.
#[async_trait]
pub trait Cycle: Send {
    async fn run(&mut self) -> CycleOutcome;
}

/// Handle to an armed poll loop.
#[derive(Debug)]
pub struct PollHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Prevent the next re-arm. A cycle already running is left to finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait for the loop to exit.
    pub async fn stop(self) -> Result<(), JoinError> {
        self.cancel.cancel();
        self.task.await
    }
}

/// Start the self-rescheduling poll loop.
///
/// The loop sleeps, runs `cycle` to completion, asks the scheduler for the
/// next delay, and only then sleeps again, so two cycles never overlap.
pub fn arm<C>(
    config: ScheduleConfig,
    cycle: C,
    state_tx: Arc<watch::Sender<EngineState>>,
) -> PollHandle
where
    C: Cycle + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(run_loop(Scheduler::new(config), cycle, token, state_tx));
    PollHandle { cancel, task }
}

async fn run_loop<C: Cycle>(
    mut scheduler: Scheduler,
    mut cycle: C,
    cancel: CancellationToken,
    state_tx: Arc<watch::Sender<EngineState>>,
) {
    info!(startup_delay = ?scheduler.current_delay(), "Poll loop started");
    loop {
        let delay = scheduler.current_delay();
        let _ = state_tx.send_replace(EngineState::Waiting {
            delay,
            consecutive_failures: scheduler.state().consecutive_failures,
        });
        trace!(?delay, "Waiting for next cycle");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Poll loop cancelled while waiting");
                break;
            }
            _ = sleep(delay) => {}
        }

        let _ = state_tx.send_replace(EngineState::Polling);
        // Not raced against cancellation: an in-flight cycle always completes.
        let outcome = cycle.run().await;
        let next = scheduler.record(outcome);
        debug!(
            next_delay = ?next,
            failures = scheduler.state().consecutive_failures,
            "Cycle finished"
        );

        if cancel.is_cancelled() {
            debug!("Poll loop cancelled during cycle, not re-arming");
            break;
        }
    }
    let _ = state_tx.send_replace(EngineState::Stopped);
    info!("Poll loop stopped");
}
