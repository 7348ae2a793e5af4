//! # credkeep-runtime
//!
//! Small building blocks shared by the credkeep crates:
//!
//! - [`EventBus`]: a callback registry. Handlers run outside of any lock
//!   and a panicking handler never prevents delivery to the others.
//! - [`ScheduledTask`]: a named interval task owning its own
//!   cancellation token. The component that spawns it also stops it.
//!
//! ## Example
//!
//! ```rust
//! use credkeep_runtime::EventBus;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let bus: EventBus<String> = EventBus::new("example");
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&seen);
//! bus.subscribe(move |_event: &String| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! bus.publish(&"hello".to_string());
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod schedule;

pub use bus::{EventBus, Handler, SubscriptionId};
pub use schedule::{ScheduledTask, TickControl};
