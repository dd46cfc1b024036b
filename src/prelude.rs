//! The commonly needed surface in one import.

pub use crate::{
  error::{
    on_error_dropped, reset_dropped_error_hook, set_dropped_error_hook,
    FlowError,
  },
  fusion::{FusionMode, PollResult, QueueSubscription},
  ops::concat_map::ErrorMode,
  ops::group_by::GroupedPublisher,
  publisher::{
    BoxPublisher, Publisher, PublisherExt, Scalar, DEFAULT_PREFETCH,
  },
  scheduler::{
    Duration, Instant, ScheduleHandle, Scheduler, Task, Worker,
  },
  source,
  subscriber::{Subscriber, SubscriptionGuard, SubscriptionHandle},
  subscription::{Subscription, Upstream, UNBOUNDED},
};
