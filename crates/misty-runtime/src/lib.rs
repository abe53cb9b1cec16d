//! `misty-runtime` – skill execution.
//!
//! Turns the robot link from `misty-middleware` into running behaviours:
//! each skill is a closed state machine whose transitions are applied by a
//! single [`SkillLoop`] consumer.
//!
//! # Modules
//!
//! - [`status`] – [`StatusStore`]: the lock-protected `{status, data, time}`
//!   record of a running skill, updated through partial [`StatusPatch`]es.
//! - [`skill`] – the [`Skill`] trait, [`SkillInputs`] queue and
//!   [`SkillLoop`] driver.
//! - [`report`] – [`ActionLog`] and the [`SkillReport`] every skill returns.
//! - [`transcribe`] – [`Transcriber`] and the wit.ai client.
//! - [`skills`] – question answering, face recognition, battery printer, key-phrase greeting.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console logs
//!   plus optional OTLP span export.

pub mod report;
pub mod skill;
pub mod skills;
pub mod status;
pub mod telemetry;
pub mod transcribe;

pub use report::{ActionEntry, ActionLog, SkillReport};
pub use skill::{Dispatch, LoopExit, Skill, SkillInput, SkillInputs, SkillLoop};
pub use status::{SkillStatus, StatusData, StatusPatch, StatusRecord, StatusStore};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use transcribe::{Transcriber, TranscriptionError, WitTranscriber};
