//! Power-failure simulator for crash-consistency tests
//!
//! A countdown shared by every writer of one database. Each storage write
//! calls [`PowerFailureSimulator::check`]; the call that takes the countdown
//! to zero fails with `SimulatedPowerLoss`, and so does every call after it
//! until the simulator is reset. A test can therefore stop a write at an
//! exact point, reopen the database, and inspect what recovery rebuilt.

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{StorageError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PowerState {
    /// No fault scheduled
    Disarmed,
    /// Fault fires on the call that brings this to zero
    Armed(u64),
    /// Fault has fired; every check fails
    Tripped,
}

/// Decrement-and-check countdown. All transitions happen under one mutex so
/// concurrent writers observe a single, deterministic trip point.
#[derive(Debug)]
pub struct PowerFailureSimulator {
    state: Mutex<PowerState>,
}

impl PowerFailureSimulator {
    /// A disarmed simulator.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PowerState::Disarmed),
        }
    }

    /// Simulator armed with `countdown` (0 leaves it disarmed).
    pub fn with_countdown(countdown: u64) -> Self {
        let sim = Self::new();
        sim.arm(countdown);
        sim
    }

    /// Schedule the fault: the `countdown`-th check from now fails.
    /// Arming with 0 disarms.
    pub fn arm(&self, countdown: u64) {
        let mut state = self.state.lock();
        *state = if countdown == 0 {
            PowerState::Disarmed
        } else {
            PowerState::Armed(countdown)
        };
    }

    /// Back to normal operation after a trip.
    pub fn reset(&self) {
        *self.state.lock() = PowerState::Disarmed;
    }

    /// Decrement the countdown and fail if power is (now) off.
    pub fn check(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        match *state {
            PowerState::Disarmed => Ok(()),
            PowerState::Armed(n) if n > 1 => {
                *state = PowerState::Armed(n - 1);
                Ok(())
            }
            PowerState::Armed(_) => {
                *state = PowerState::Tripped;
                warn!("simulated power failure triggered");
                Err(StorageError::SimulatedPowerLoss { path: None })
            }
            PowerState::Tripped => Err(StorageError::SimulatedPowerLoss { path: None }),
        }
    }

    /// True once the fault has fired.
    pub fn is_tripped(&self) -> bool {
        *self.state.lock() == PowerState::Tripped
    }

    /// Remaining checks before the fault fires, if armed.
    pub fn remaining(&self) -> Option<u64> {
        match *self.state.lock() {
            PowerState::Armed(n) => Some(n),
            _ => None,
        }
    }
}

impl Default for PowerFailureSimulator {
    fn default() -> Self {
        Self::new()
    }
}
