//! Exclusive mode: one session may lock every other session out
//!
//! States: `Normal` and `ExclusiveHeld(owner)`. While a session holds the
//! lock, a new connection is rejected immediately with
//! `ExclusiveModeActive`, but a statement from an already-connected session
//! waits on a condition variable until the lock is released (explicitly or by
//! the holder disconnecting). Disconnecting a waiting session, or shutting
//! the database down, wakes its wait with `ConnectionClosed`.
//!
//! Every transition and every wait happens under one mutex, so two sessions
//! racing to acquire can never both succeed.

use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info};

use keystone_core::{SessionId, StorageError, StoreResult};

/// Observable lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusiveState {
    /// No holder; every session proceeds
    Normal,
    /// One session holds exclusive use
    ExclusiveHeld(SessionId),
}

#[derive(Debug, Default)]
struct State {
    holder: Option<SessionId>,
    /// Sessions admitted and not yet disconnected
    connected: HashSet<SessionId>,
    shutdown: bool,
}

/// Per-database exclusive-mode state machine.
#[derive(Debug, Default)]
pub struct ExclusiveModeController {
    state: Mutex<State>,
    /// Signalled on release, auto-release, disconnect and shutdown
    changed: Condvar,
}

impl ExclusiveModeController {
    /// Controller in `Normal` mode with no sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> ExclusiveState {
        match self.state.lock().holder {
            Some(holder) => ExclusiveState::ExclusiveHeld(holder),
            None => ExclusiveState::Normal,
        }
    }

    /// True if `session` holds the lock.
    pub fn is_holder(&self, session: SessionId) -> bool {
        self.state.lock().holder == Some(session)
    }

    /// Admission for a new connection. Never blocks: fails with
    /// `ExclusiveModeActive` if another session holds the lock.
    pub fn admit(&self, session: SessionId) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(StorageError::DatabaseClosed);
        }
        if let Some(holder) = state.holder {
            if holder != session {
                debug!(%session, %holder, "connection rejected, exclusive mode active");
                return Err(StorageError::ExclusiveModeActive { holder });
            }
        }
        state.connected.insert(session);
        Ok(())
    }

    /// Gate in front of every statement of a connected session. Returns at
    /// once for the holder or in `Normal` mode; otherwise blocks until the
    /// lock is released.
    pub fn execute_gate(&self, session: SessionId) -> StoreResult<()> {
        let _state = self.wait_turn(session)?;
        Ok(())
    }

    /// `SET EXCLUSIVE`. Acquiring waits like any statement if another
    /// session holds the lock. Releasing by a session that does not hold it
    /// is a no-op.
    pub fn set_exclusive(&self, session: SessionId, enable: bool) -> StoreResult<()> {
        let mut state = self.wait_turn(session)?;
        match (enable, state.holder) {
            (true, None) => {
                state.holder = Some(session);
                info!(%session, "exclusive mode acquired");
            }
            (false, Some(holder)) if holder == session => {
                state.holder = None;
                info!(%session, "exclusive mode released");
                self.changed.notify_all();
            }
            _ => {}
        }
        Ok(())
    }

    /// Session lifecycle end. Releases the lock if `session` held it and
    /// cancels any wait the session is parked in.
    pub fn disconnect(&self, session: SessionId) {
        let mut state = self.state.lock();
        let was_connected = state.connected.remove(&session);
        let was_holder = state.holder == Some(session);
        if was_holder {
            state.holder = None;
            info!(%session, "exclusive mode released on disconnect");
        }
        if was_connected || was_holder {
            self.changed.notify_all();
        }
    }

    /// Database close: drop the lock, disconnect everyone, refuse new
    /// admissions.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.holder = None;
        state.connected.clear();
        self.changed.notify_all();
    }

    /// Lock the state once `session` may proceed.
    fn wait_turn(&self, session: SessionId) -> StoreResult<MutexGuard<'_, State>> {
        let mut state = self.state.lock();
        let mut waited = false;
        loop {
            if !state.connected.contains(&session) {
                return Err(StorageError::ConnectionClosed { session });
            }
            match state.holder {
                Some(holder) if holder != session => {
                    if !waited {
                        debug!(%session, %holder, "waiting for exclusive mode release");
                        waited = true;
                    }
                    self.changed.wait(&mut state);
                }
                _ => return Ok(state),
            }
        }
    }
}
