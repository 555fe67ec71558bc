use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl ControlState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlState::Idle => "idle",
            ControlState::Running => "running",
            ControlState::Paused => "paused",
            ControlState::Stopped => "stopped",
            ControlState::Completed => "completed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ControlState::Running | ControlState::Paused)
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thread-safe control cell shared between the batch loop and whoever issues
/// commands. Cloning yields another handle to the same cell.
#[derive(Clone)]
pub struct RunControl {
    tx: Arc<watch::Sender<ControlState>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlState::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ControlState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControlState> {
        self.tx.subscribe()
    }

    pub fn pause(&self) -> AppResult<ControlState> {
        self.transition("pause", |state| match state {
            ControlState::Running => Some(ControlState::Paused),
            _ => None,
        })
    }

    pub fn resume(&self) -> AppResult<ControlState> {
        self.transition("resume", |state| match state {
            ControlState::Paused => Some(ControlState::Running),
            _ => None,
        })
    }

    pub fn stop(&self) -> AppResult<ControlState> {
        self.transition("stop", |state| match state {
            ControlState::Running | ControlState::Paused => Some(ControlState::Stopped),
            _ => None,
        })
    }

    pub(crate) fn begin(&self) -> AppResult<ControlState> {
        self.transition("start", |state| match state {
            ControlState::Idle | ControlState::Stopped | ControlState::Completed => {
                Some(ControlState::Running)
            }
            _ => None,
        })
    }

    pub(crate) fn complete(&self) -> AppResult<ControlState> {
        self.transition("complete", |state| match state {
            ControlState::Running | ControlState::Paused => Some(ControlState::Completed),
            _ => None,
        })
    }

    /// Blocks while the run is paused. Wakes on every state change and at
    /// least once per `poll` so a lost wake-up cannot stall the loop.
    pub async fn wait_while_paused(&self, poll: Duration) -> ControlState {
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state != ControlState::Paused {
                return state;
            }
            let _ = timeout(poll, rx.changed()).await;
        }
    }

    /// Sleeps for `duration` unless a stop arrives first.
    pub async fn sleep_unless_stopped(&self, duration: Duration) -> AppResult<()> {
        if duration.is_zero() {
            return self.check_stopped();
        }
        let mut rx = self.tx.subscribe();
        tokio::select! {
            _ = sleep(duration) => Ok(()),
            _ = rx.wait_for(|state| *state == ControlState::Stopped) => Err(AppError::Interrupted),
        }
    }

    pub(crate) fn check_stopped(&self) -> AppResult<()> {
        if self.state() == ControlState::Stopped {
            Err(AppError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn transition(
        &self,
        command: &'static str,
        next: impl FnOnce(ControlState) -> Option<ControlState>,
    ) -> AppResult<ControlState> {
        let mut outcome = None;
        self.tx.send_if_modified(|state| {
            let current = *state;
            match next(current) {
                Some(target) => {
                    *state = target;
                    outcome = Some(Ok(target));
                    true
                }
                None => {
                    outcome = Some(Err(AppError::InvalidTransition {
                        command,
                        from: current,
                    }));
                    false
                }
            }
        });
        outcome.unwrap_or(Err(AppError::InvalidTransition {
            command,
            from: self.state(),
        }))
    }
}
