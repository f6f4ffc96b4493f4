// Failsafe watchdog
// Note: the watchdog stops the motors if the controlling program stops sending
// commands. Without it a crashed caller would leave the robot driving at
// whatever power it last asked for.
//
// States:
//   Disarmed --(non-zero drive)--> Armed --(timeout on tick)--> Tripped
//   Armed  --(any successful command)--> Armed (timer reset)
//   Tripped --(halt dispatched)--> Disarmed
//   any    --(caller halt)--> Disarmed

use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Builder;
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::board::protocol::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogPhase {
    Disarmed,
    Armed,
    Tripped,
}

/// What a successful exchange means for the watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// A motor was commanded to a non-zero power
    Drive,
    /// All motors were switched off
    Halt,
    /// Anything else (reads, LEDs, zero drive)
    Other,
}

impl Activity {
    /// Classify a dispatched command by its code and payload
    pub fn of(command: Command, payload: &[u8]) -> Self {
        match command {
            Command::SetMotorAForward
            | Command::SetMotorAReverse
            | Command::SetMotorBForward
            | Command::SetMotorBReverse
            | Command::SetAllForward
            | Command::SetAllReverse => {
                if payload.first().copied().unwrap_or(0) != 0 {
                    Activity::Drive
                } else {
                    Activity::Other
                }
            }
            Command::AllOff => Activity::Halt,
            _ => Activity::Other,
        }
    }
}

/// Liveness bookkeeping for one session
#[derive(Debug, Clone)]
pub struct WatchdogState {
    phase: WatchdogPhase,
    last_command: Instant,
    timeout: Duration,
}

impl WatchdogState {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            phase: WatchdogPhase::Disarmed,
            last_command: now,
            timeout,
        }
    }

    pub fn phase(&self) -> WatchdogPhase {
        self.phase
    }

    pub fn armed(&self) -> bool {
        self.phase != WatchdogPhase::Disarmed
    }

    /// Record a successful exchange
    pub fn record(&mut self, now: Instant, activity: Activity) {
        self.last_command = now;
        match activity {
            Activity::Halt => self.disarm(),
            Activity::Drive if self.phase != WatchdogPhase::Armed => {
                debug!("Watchdog armed ({:?} timeout)", self.timeout);
                self.phase = WatchdogPhase::Armed;
            }
            _ => {}
        }
    }

    pub fn disarm(&mut self) {
        if self.phase != WatchdogPhase::Disarmed {
            debug!("Watchdog disarmed");
        }
        self.phase = WatchdogPhase::Disarmed;
    }

    /// Timeout check, run on every tick. Returns true if a halt must be sent.
    ///
    /// Stays `Tripped` (and keeps asking for a halt) until one succeeds.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.phase {
            WatchdogPhase::Disarmed => false,
            WatchdogPhase::Tripped => true,
            WatchdogPhase::Armed => {
                let age = now.saturating_duration_since(self.last_command);
                if age > self.timeout {
                    warn!("Command stale ({:?} old), stopping motors", age);
                    self.phase = WatchdogPhase::Tripped;
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// Background ticker driving the timeout check
///
/// Runs on its own thread with its own single-threaded runtime, so ticks keep
/// coming while the caller is blocked. Dropping the task (or calling `cancel`)
/// stops the ticker and waits for the thread to exit.
pub struct WatchdogTask {
    cancel: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WatchdogTask {
    /// Start the ticker, calling `on_tick` every `period`
    pub fn spawn<F>(period: Duration, mut on_tick: F) -> io::Result<Self>
    where
        F: FnMut(Instant) + Send + 'static,
    {
        let (cancel, mut cancelled) = oneshot::channel::<()>();
        let runtime = Builder::new_current_thread().enable_time().build()?;

        let thread = thread::Builder::new()
            .name("thunderborg-watchdog".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let mut tick = interval(period);
                    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    info!("Watchdog started: {}ms tick", period.as_millis());

                    loop {
                        tokio::select! {
                            _ = &mut cancelled => break,
                            _ = tick.tick() => on_tick(Instant::now()),
                        }
                    }

                    debug!("Watchdog stopped");
                });
            })?;

        Ok(Self {
            cancel: Some(cancel),
            thread: Some(thread),
        })
    }

    /// Stop ticking; no `on_tick` call starts after this returns
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Watchdog thread panicked");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|thread| thread.is_finished())
    }
}

impl Drop for WatchdogTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
