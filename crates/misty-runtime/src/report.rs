//! Aggregated outcome of a skill run.

use misty_types::ActionResult;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// One robot call made during a skill run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionEntry {
    pub name: String,
    #[serde(flatten)]
    pub result: ActionResult,
}

/// Ordered record of every robot call a skill made.
#[derive(Debug, Clone, Default)]
pub struct ActionLog {
    entries: Vec<ActionEntry>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `result` under `name` and hand it back for inspection.
    pub fn record(&mut self, name: impl Into<String>, result: ActionResult) -> ActionResult {
        let name = name.into();
        if !result.success {
            warn!(action = %name, message = ?result.message, "robot action failed");
        }
        self.entries.push(ActionEntry {
            name,
            result: result.clone(),
        });
        result
    }

    pub fn entries(&self) -> &[ActionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of recorded actions, in call order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn report(&self) -> SkillReport {
        SkillReport {
            overall_success: self.entries.iter().all(|e| e.result.success),
            actions: self.entries.clone(),
            data: None,
        }
    }
}

/// What a finished skill hands back to its caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillReport {
    /// `true` iff every recorded action succeeded.
    pub overall_success: bool,
    pub actions: Vec<ActionEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl SkillReport {
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The recorded actions that failed.
    pub fn failures(&self) -> impl Iterator<Item = &ActionEntry> {
        self.actions.iter().filter(|e| !e.result.success)
    }
}
