//! Factory functions constructing publishers.

mod defer;
mod empty;
mod fail;
mod from_fn;
mod from_iter;
#[cfg(feature = "timer")]
mod interval;
mod just;
mod range;
#[cfg(feature = "timer")]
mod timer;

pub use defer::{defer, DeferPublisher};
pub use empty::{empty, EmptyPublisher};
pub use fail::{fail, FailPublisher};
pub use from_fn::{from_fn, FromFnPublisher};
pub use from_iter::{from_iter, IterPublisher};
#[cfg(feature = "timer")]
pub use interval::{interval, IntervalPublisher};
pub use just::{just, JustPublisher};
pub use range::{range, RangePublisher};
#[cfg(feature = "timer")]
pub use timer::{timer, TimerPublisher};
