//! The skill loop: a single consumer driving a skill's state machine.
//!
//! Push events (forwarded from the [`LocalEventBus`][misty_middleware::LocalEventBus])
//! and console lines arrive on one [`SkillInputs`] queue.  [`SkillLoop::run`]
//! is the only place that applies them, so every transition is one atomic
//! [`StatusStore`] update and no two handlers ever run concurrently.
//!
//! Each iteration:
//!
//! 1. apply every input already queued, in arrival order;
//! 2. read the status and stop if it is terminal;
//! 3. dispatch exactly one handler for that status;
//! 4. on [`Dispatch::AwaitInput`], block until the next input arrives.

use std::sync::Arc;

use async_trait::async_trait;
use misty_types::Event;
use tokio::sync::mpsc;
use tracing::debug;

use crate::status::{SkillStatus, StatusStore};

/// Something that can drive a skill's state machine.
#[derive(Debug, Clone)]
pub enum SkillInput {
    Event(Event),
    /// One console line, trimmed.
    UserLine(String),
}

impl From<Event> for SkillInput {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

/// What the loop does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Re-read the status and dispatch again.
    Continue,
    /// Nothing to do until the next input.
    AwaitInput,
    /// End the loop.
    Stop,
}

/// Why [`SkillLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit<S> {
    /// The status reached a terminal state.
    Terminal(S),
    /// A handler returned [`Dispatch::Stop`].
    Stopped(S),
    /// Every input sender was dropped.
    InputClosed(S),
}

#[async_trait]
pub trait Skill: Send {
    type Status: SkillStatus;

    /// Apply one input.  Runs only between handler invocations.
    async fn on_input(&mut self, input: SkillInput, store: &StatusStore<Self::Status>);

    /// Run the handler for `status`.
    async fn dispatch(&mut self, status: Self::Status, store: &StatusStore<Self::Status>) -> Dispatch;
}

/// Sender/receiver pair feeding a [`SkillLoop`].
#[derive(Debug)]
pub struct SkillInputs {
    tx: mpsc::UnboundedSender<SkillInput>,
    rx: mpsc::UnboundedReceiver<SkillInput>,
}

impl Default for SkillInputs {
    fn default() -> Self {
        Self::new()
    }
}

impl SkillInputs {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// A handle for producers (bus forwarding, console reader).
    pub fn sender(&self) -> mpsc::UnboundedSender<SkillInput> {
        self.tx.clone()
    }

    /// Drop the local sender; the queue closes once every producer is gone.
    pub fn into_receiver(self) -> mpsc::UnboundedReceiver<SkillInput> {
        self.rx
    }
}

/// Owns a skill, its status store and its input queue.
pub struct SkillLoop<K: Skill> {
    skill: K,
    store: Arc<StatusStore<K::Status>>,
    inputs: mpsc::UnboundedReceiver<SkillInput>,
}

impl<K: Skill> SkillLoop<K> {
    pub fn new(
        skill: K,
        store: Arc<StatusStore<K::Status>>,
        inputs: mpsc::UnboundedReceiver<SkillInput>,
    ) -> Self {
        Self { skill, store, inputs }
    }

    pub fn store(&self) -> &Arc<StatusStore<K::Status>> {
        &self.store
    }

    pub fn skill(&self) -> &K {
        &self.skill
    }

    pub fn into_skill(self) -> K {
        self.skill
    }

    pub async fn run(&mut self) -> LoopExit<K::Status> {
        loop {
            while let Ok(input) = self.inputs.try_recv() {
                self.skill.on_input(input, &self.store).await;
            }

            let status = self.store.status();
            if status.is_terminal() {
                debug!(?status, "terminal status reached");
                return LoopExit::Terminal(status);
            }

            match self.skill.dispatch(status, &self.store).await {
                Dispatch::Continue => {}
                Dispatch::Stop => return LoopExit::Stopped(self.store.status()),
                Dispatch::AwaitInput => match self.inputs.recv().await {
                    Some(input) => self.skill.on_input(input, &self.store).await,
                    None => return LoopExit::InputClosed(self.store.status()),
                },
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
