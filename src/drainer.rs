//! Notification drainer: shows queued events one at a time.
//!
//! DESIGN
//! ======
//! `DrainMachine` is the pure state machine (Idle -> Displaying -> FadingOut
//! -> Idle). It pops from the live queue and tells the caller how long to hold
//! each state. `Drainer` drives it with tokio timers, publishes the visible
//! state on a watch channel (one value, so at most one message is visible),
//! and guards each pass with a boolean latch so two passes never overlap.
//!
//! A pass ends when the queue is empty, when the head event is not one of the
//! display types (that event is dropped, later events stay queued for the next
//! pass), or when the owning session's token is cancelled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::queue::MessageQueue;

pub const DEFAULT_DWELL_MS: u64 = 3700;
pub const DEFAULT_FADE_MS: u64 = 300;

/// Fixed per-message hold durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainTiming {
    pub dwell: Duration,
    pub fade: Duration,
}

impl DrainTiming {
    /// Visible time of one message, dwell plus fade.
    #[must_use]
    pub fn per_message(&self) -> Duration {
        self.dwell + self.fade
    }
}

impl Default for DrainTiming {
    fn default() -> Self {
        Self { dwell: Duration::from_millis(DEFAULT_DWELL_MS), fade: Duration::from_millis(DEFAULT_FADE_MS) }
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

/// What the notification area currently shows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DisplayState {
    #[default]
    Idle,
    Displaying {
        message: String,
    },
    FadingOut {
        message: String,
    },
}

impl DisplayState {
    /// The message on screen, including while it fades.
    #[must_use]
    pub fn visible_message(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Displaying { message } | Self::FadingOut { message } => Some(message),
        }
    }
}

/// Why a drain pass stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassEnd {
    /// Queue ran empty.
    Drained,
    /// Head event was not a display type; it was discarded.
    Halted { kind: &'static str },
    /// The owning session went away mid-pass.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainStep {
    Show { message: String, hold: Duration },
    Fade { hold: Duration },
    Finished(PassEnd),
}

pub struct DrainMachine {
    state: DisplayState,
    timing: DrainTiming,
}

impl DrainMachine {
    #[must_use]
    pub fn new(timing: DrainTiming) -> Self {
        Self { state: DisplayState::Idle, timing }
    }

    #[must_use]
    pub fn state(&self) -> &DisplayState {
        &self.state
    }

    /// Move to the next state, popping the queue head when a new message is needed.
    pub fn advance(&mut self, queue: &MessageQueue) -> DrainStep {
        match std::mem::take(&mut self.state) {
            DisplayState::Displaying { message } => {
                self.state = DisplayState::FadingOut { message };
                DrainStep::Fade { hold: self.timing.fade }
            }
            DisplayState::Idle | DisplayState::FadingOut { .. } => {
                let Some(event) = queue.pop_front() else {
                    return DrainStep::Finished(PassEnd::Drained);
                };
                let Some(message) = event.display_message() else {
                    return DrainStep::Finished(PassEnd::Halted { kind: event.kind() });
                };
                self.state = DisplayState::Displaying { message: message.to_owned() };
                DrainStep::Show { message: message.to_owned(), hold: self.timing.dwell }
            }
        }
    }
}

// =============================================================================
// LATCH
// =============================================================================

struct LatchGuard<'a>(&'a AtomicBool);

impl<'a> LatchGuard<'a> {
    fn try_acquire(latch: &'a AtomicBool) -> Option<Self> {
        latch
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(latch))
    }
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// DRAINER
// =============================================================================

pub struct Drainer {
    queue: MessageQueue,
    timing: DrainTiming,
    draining: AtomicBool,
    display: watch::Sender<DisplayState>,
}

impl Drainer {
    #[must_use]
    pub fn new(queue: MessageQueue, timing: DrainTiming) -> Self {
        let (display, _) = watch::channel(DisplayState::Idle);
        Self { queue, timing, draining: AtomicBool::new(false), display }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DisplayState> {
        self.display.subscribe()
    }

    #[must_use]
    pub fn current(&self) -> DisplayState {
        self.display.borrow().clone()
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Run one drain pass. Returns `None` without touching the queue if
    /// another pass already holds the latch.
    pub async fn drain_pass(&self, cancel: &CancellationToken) -> Option<PassEnd> {
        let _latch = LatchGuard::try_acquire(&self.draining)?;
        let mut machine = DrainMachine::new(self.timing);

        let end = loop {
            let hold = match machine.advance(&self.queue) {
                DrainStep::Show { hold, .. } | DrainStep::Fade { hold } => hold,
                DrainStep::Finished(end) => break end,
            };
            self.display.send_replace(machine.state().clone());

            tokio::select! {
                () = cancel.cancelled() => break PassEnd::Cancelled,
                () = tokio::time::sleep(hold) => {}
            }
        };

        self.display.send_replace(DisplayState::Idle);
        Some(end)
    }
}

/// Spawn the scheduler that starts a drain pass whenever events arrive.
///
/// Runs until `cancel` fires. A pass it was running clears the display on
/// the way out; an idle scheduler leaves the display to whoever owns it now.
pub fn spawn_drainer(drainer: Arc<Drainer>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = drainer.queue.arrived() => {}
            }
            if drainer.queue.is_empty() {
                continue;
            }

            match drainer.drain_pass(&cancel).await {
                Some(PassEnd::Drained) => debug!("drain pass emptied queue"),
                Some(PassEnd::Halted { kind }) => {
                    warn!(kind, remaining = drainer.queue.len(), "drain pass halted on non-display event");
                }
                Some(PassEnd::Cancelled) => break,
                None => debug!("drain pass already running"),
            }
        }
        debug!("drainer stopped");
    })
}

#[cfg(test)]
#[path = "drainer_test.rs"]
mod tests;
