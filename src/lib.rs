//! # rxflow: backpressure-aware Reactive Streams for Rust
//!
//! A runtime for composing asynchronous value sequences with subscribers
//! that explicitly negotiate the rate of delivery, and operators that
//! transform sequences without breaking that negotiation.
//!
//! ## Quick Start
//!
//! ```rust
//! use rxflow::prelude::*;
//! use std::sync::{Arc, Mutex};
//!
//! let squares = Arc::new(Mutex::new(Vec::new()));
//! let sink = squares.clone();
//! source::range(1, 5)
//!   .map(|v| v * v)
//!   .subscribe(move |v| sink.lock().unwrap().push(v));
//! assert_eq!(*squares.lock().unwrap(), vec![1, 4, 9, 16, 25]);
//! ```
//!
//! ## Key Concepts
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Publisher`] | Emits a value sequence to a subscribed [`Subscriber`] |
//! | [`Subscriber`] | Consumes `on_next` values and one terminal signal |
//! | [`Subscription`] | The demand (`request`) / cancellation channel |
//! | [`QueueSubscription`] | A fusable subscription consumers can `poll` |
//! | [`Scheduler`] / [`Worker`] | Execution boundaries for time-shifting ops |
//!
//! Demand is credit-based: a subscriber only ever receives as many values
//! as it has `request`ed, and the buffering operators (`publish_on`,
//! `flat_map`, `concat_map`, `group_by`) bound their queues by an explicit
//! prefetch. Adjacent stages negotiate *fusion* to skip intermediate
//! queues entirely where delivery mechanics allow it.
//!
//! [`Publisher`]: publisher::Publisher
//! [`Subscriber`]: subscriber::Subscriber
//! [`Subscription`]: subscription::Subscription
//! [`QueueSubscription`]: fusion::QueueSubscription
//! [`Scheduler`]: scheduler::Scheduler
//! [`Worker`]: scheduler::Worker

pub mod drain;
pub mod error;
pub mod fusion;
pub mod ops;
pub mod prelude;
pub mod publisher;
pub mod queue;
pub mod scheduler;
pub mod source;
pub mod subscriber;
pub mod subscription;
pub mod test_support;

pub use prelude::*;
