//! Backend liveness state machine.
//!
//! # State Transitions
//! ```text
//! Live → Dead: consecutive failures >= fails
//! Dead → Live: consecutive successes >= passes
//! ```
//!
//! A result that agrees with the current state resets the opposite
//! counter, so only uninterrupted runs flip the state.

/// Hysteresis over raw check outcomes. Starts live.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    live: bool,
    passes: u32,
    fails: u32,
    passes_needed: u32,
    fails_needed: u32,
}

impl LivenessTracker {
    pub fn new(passes: u32, fails: u32) -> Self {
        Self {
            live: true,
            passes: 0,
            fails: 0,
            passes_needed: passes.max(1),
            fails_needed: fails.max(1),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Record one outcome. Returns the new state on a transition.
    pub fn record(&mut self, success: bool) -> Option<bool> {
        match (self.live, success) {
            (true, true) => {
                self.fails = 0;
                None
            }
            (false, false) => {
                self.passes = 0;
                None
            }
            (true, false) => {
                self.fails += 1;
                if self.fails >= self.fails_needed {
                    self.transition(false)
                } else {
                    None
                }
            }
            (false, true) => {
                self.passes += 1;
                if self.passes >= self.passes_needed {
                    self.transition(true)
                } else {
                    None
                }
            }
        }
    }

    fn transition(&mut self, live: bool) -> Option<bool> {
        self.live = live;
        self.passes = 0;
        self.fails = 0;
        Some(live)
    }
}
