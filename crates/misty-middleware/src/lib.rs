//! `misty-middleware` – the robot link.
//!
//! Routes the robot's asynchronous push events into the process and carries
//! commands back out, without caring what the data means.
//!
//! # Modules
//!
//! - [`protocol`] – JSON control frames and inbound frame parsing for the
//!   `ws://<ip>/pubsub` push channel.
//! - [`bus`] – [`LocalEventBus`]: name-keyed, in-process publish/subscribe
//!   registry with ordered listeners and single-consumer queues.
//! - [`subscription`] – [`EventSubscription`]: one background task per
//!   subscribed event type, bounded message/error histories, blocking
//!   idempotent unsubscribe.
//! - [`action`] – [`ActionApi`]: the request/response command interface,
//!   with a REST implementation.

pub mod action;
pub mod bus;
pub mod protocol;
pub mod subscription;

pub use action::{ActionApi, RestActionApi};
pub use bus::LocalEventBus;
pub use protocol::{ControlMessage, pubsub_url};
pub use subscription::{EventSubscription, SubscriptionConfig, SubscriptionState};
