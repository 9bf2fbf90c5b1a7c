//! Node Capacity Ramping
//!
//! A node's share of the ring moves one point per warm-up interval toward its
//! target, so a capacity change never remaps more than one point's worth of
//! keys per tick.
//!
//! ```text
//!   {absent} ── add_node ──▶ {ramping} ── current == target ──▶ {steady}
//!                               ▲                                  │
//!                               └──────── set_node_capacity ◀──────┘
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Direction a node's capacity is moving in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampState {
    Idle,
    RampingUp,
    RampingDown,
}

/// Current and target ring points of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeCapacity {
    /// Points currently on the ring
    pub current: usize,
    /// Points the node is moving toward
    pub target: usize,
    /// Interval between single-point steps; `None` or zero applies changes at once
    pub warm_up: Option<Duration>,
}

impl NodeCapacity {
    /// A fresh node: no points yet, ramping toward `target`
    pub fn new(target: usize, warm_up: Option<Duration>) -> Self {
        Self {
            current: 0,
            target,
            warm_up,
        }
    }

    pub fn state(&self) -> RampState {
        use std::cmp::Ordering::*;
        match self.current.cmp(&self.target) {
            Equal => RampState::Idle,
            Less => RampState::RampingUp,
            Greater => RampState::RampingDown,
        }
    }

    /// Warm-up interval, if changes should be spread over time
    pub fn ramp_interval(&self) -> Option<Duration> {
        self.warm_up.filter(|d| !d.is_zero())
    }

    /// Move `current` one point toward `target`. Returns false if already there.
    pub fn step(&mut self) -> bool {
        match self.state() {
            RampState::Idle => false,
            RampState::RampingUp => {
                self.current += 1;
                true
            }
            RampState::RampingDown => {
                self.current -= 1;
                true
            }
        }
    }

    /// Jump straight to the target
    pub fn settle(&mut self) {
        self.current = self.target;
    }

    /// No points now and none wanted: the node can be torn down
    pub fn is_retired(&self) -> bool {
        self.current == 0 && self.target == 0
    }
}

// =============================================================================
// Ramp Ticker
// =============================================================================

/// What a tick callback wants to happen next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    Continue,
    Done,
}

/// Handle to a per-node ramp task. Cancelled on drop.
///
/// The task awaits each callback before waiting for the next tick, so ticks
/// of one node never overlap.
#[derive(Debug)]
pub(crate) struct RampTicker {
    token: CancellationToken,
}

impl RampTicker {
    /// Spawn a task calling `on_tick` every `every`, first after one full
    /// interval. The callback receives the ticker's cancellation token so it
    /// can detect a cancel that raced with the tick.
    pub(crate) fn spawn<F, Fut>(every: Duration, mut on_tick: F) -> Self
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = TickOutcome> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + every, every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tick.tick() => {
                        if on_tick(cancelled.clone()).await == TickOutcome::Done {
                            break;
                        }
                    }
                }
            }
        });

        Self { token }
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for RampTicker {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================
