//! In-process event bus.
//!
//! A single dispatcher task serializes publishes and owns one buffer
//! per subscriber, so a slow consumer never blocks a fast one or the
//! publisher beyond its own buffer growth. Events are delivered to
//! every live subscriber in publish order.
//!
//! Cloning a subscriber replays the cloning subscriber's
//! buffered-but-unread events to the new subscriber, then the two
//! diverge independently. This is the property the bid engine relies
//! on when it forks a per-order subscription: no event between
//! service observation and order start is lost.

mod bus;

pub use bus::{Bus, PubsubError, Subscriber};
