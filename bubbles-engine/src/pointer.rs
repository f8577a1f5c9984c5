//! Local pointer state shared by touch input, the autopilot and the
//! outbound network path.
//!
//! Writers are touch input (always accepted) and the autopilot (refused
//! while a touch is live). The outbound path only reads: it sends the
//! current position and then acknowledges the version it sent, which
//! clears the dirty flag only if nothing was written in between.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// Who currently drives the local position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Driver {
    #[default]
    Idle,
    Touch,
    Autopilot,
}

/// Coherent copy of the pointer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointerSnapshot {
    pub x: i32,
    pub y: i32,
    pub driver: Driver,
    pub dirty: bool,
    /// Bumped on every accepted write
    pub version: u64,
}

#[derive(Default)]
pub struct LocalPointer {
    state: Mutex<PointerSnapshot>,
    changed: Notify,
}

impl LocalPointer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PointerSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(state: &mut PointerSnapshot, x: i32, y: i32) {
        state.x = x;
        state.y = y;
        state.dirty = true;
        state.version += 1;
    }

    /// A touch begins at `(x, y)`. From now on the autopilot is locked out.
    pub fn touch_down(&self, x: i32, y: i32) {
        {
            let mut state = self.lock();
            state.driver = Driver::Touch;
            Self::write(&mut state, x, y);
        }
        self.changed.notify_one();
    }

    /// The touch ends at `(x, y)` and the autopilot may take over again.
    pub fn touch_up(&self, x: i32, y: i32) {
        {
            let mut state = self.lock();
            Self::write(&mut state, x, y);
            state.driver = Driver::Idle;
        }
        self.changed.notify_one();
    }

    /// Move without changing the touch state.
    pub fn move_to(&self, x: i32, y: i32) {
        Self::write(&mut self.lock(), x, y);
        self.changed.notify_one();
    }

    /// Autopilot write. Returns false, leaving the state untouched, if a
    /// touch is live.
    pub fn autopilot_move(&self, x: i32, y: i32) -> bool {
        {
            let mut state = self.lock();
            if state.driver == Driver::Touch {
                return false;
            }
            state.driver = Driver::Autopilot;
            Self::write(&mut state, x, y);
        }
        self.changed.notify_one();
        true
    }

    pub fn snapshot(&self) -> PointerSnapshot {
        *self.lock()
    }

    pub fn position(&self) -> (i32, i32) {
        let state = self.lock();
        (state.x, state.y)
    }

    pub fn has_active_touch(&self) -> bool {
        self.lock().driver == Driver::Touch
    }

    /// Acknowledge a send of `version`. Returns true if the dirty flag was cleared.
    pub fn mark_sent(&self, version: u64) -> bool {
        let mut state = self.lock();
        if state.version == version {
            state.dirty = false;
            true
        } else {
            false
        }
    }

    /// Force the next outbound cycle to resend the position.
    pub fn mark_dirty(&self) {
        self.lock().dirty = true;
        self.changed.notify_one();
    }

    /// Back to the origin, idle and clean.
    pub fn reset(&self) {
        *self.lock() = PointerSnapshot::default();
    }

    /// Resolves after the next write (or immediately if one happened
    /// since the last wait).
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}
