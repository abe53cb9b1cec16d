//! Shared, lock-protected state of a running skill.
//!
//! A [`StatusStore`] holds one [`StatusRecord`]: the current state-machine
//! status, an auxiliary data slot and a timestamp.  Writers apply a
//! [`StatusPatch`]; fields left as `None` keep their current value, so a
//! partial update never clobbers what it does not name.
//!
//! | Field | Initial value | Typical contents |
//! |---|---|---|
//! | `status` | `S::default()` (`Initialised`) | current state |
//! | `data` | [`StatusData::Empty`] | last face label, transcript, reply type |
//! | `time` | `0.0` | seconds since the epoch of the last handled event |

use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tracing::debug;

/// A skill's closed set of states.
pub trait SkillStatus: Copy + Eq + Default + Debug + Send + Sync + 'static {
    /// States at which the skill loop ends.
    fn is_terminal(&self) -> bool {
        false
    }
}

/// Auxiliary value carried next to the status.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum StatusData {
    #[default]
    Empty,
    Text(String),
    Json(Value),
}

impl StatusData {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// The three fields of a [`StatusStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord<S> {
    pub status: S,
    pub data: StatusData,
    pub time: f64,
}

impl<S: Default> Default for StatusRecord<S> {
    fn default() -> Self {
        Self {
            status: S::default(),
            data: StatusData::Empty,
            time: 0.0,
        }
    }
}

/// Partial update of a [`StatusRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPatch<S> {
    pub status: Option<S>,
    pub data: Option<StatusData>,
    pub time: Option<f64>,
}

impl<S> Default for StatusPatch<S> {
    fn default() -> Self {
        Self {
            status: None,
            data: None,
            time: None,
        }
    }
}

impl<S> StatusPatch<S> {
    /// Patch that only changes the status.
    pub fn status(status: S) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Patch that only changes the data slot.
    pub fn data(data: StatusData) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// Patch that only changes the timestamp.
    pub fn time(time: f64) -> Self {
        Self {
            time: Some(time),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: StatusData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_time(mut self, time: f64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.data.is_none() && self.time.is_none()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Thread-safe holder of a skill's [`StatusRecord`].
///
/// Share it behind an `Arc`.  Every method takes the lock once, so each
/// [`set`][Self::set] is observed either entirely or not at all.
#[derive(Debug, Default)]
pub struct StatusStore<S> {
    record: Mutex<StatusRecord<S>>,
}

impl<S: SkillStatus> StatusStore<S> {
    pub fn new() -> Self {
        Self {
            record: Mutex::new(StatusRecord::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusRecord<S>> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `patch`, leaving absent fields untouched.
    pub fn set(&self, patch: StatusPatch<S>) {
        if patch.is_empty() {
            return;
        }
        let mut record = self.lock();
        if let Some(status) = patch.status {
            if status != record.status {
                debug!(from = ?record.status, to = ?status, "status transition");
            }
            record.status = status;
        }
        if let Some(data) = patch.data {
            record.data = data;
        }
        if let Some(time) = patch.time {
            record.time = time;
        }
    }

    pub fn status(&self) -> S {
        self.lock().status
    }

    pub fn data(&self) -> StatusData {
        self.lock().data.clone()
    }

    pub fn time(&self) -> f64 {
        self.lock().time
    }

    /// Consistent copy of all three fields.
    pub fn snapshot(&self) -> StatusRecord<S> {
        self.lock().clone()
    }

    /// Read-modify-write under a single lock acquisition.
    pub fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut StatusRecord<S>) -> R,
    {
        f(&mut self.lock())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
