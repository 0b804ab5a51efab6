//! Types that are used across multiple components of graphlock-rs.
//!
//! Types specific to a single component, e.g., the statistics of the
//! [throttler](crate::throttle::MessageThrottler), live in that component's module.

pub mod data_types;

pub mod lock;

pub use data_types::{DocumentId, ElementId, SubgraphId, Timestamp, UserId};

pub use lock::{LockRecord, LockState, PendingRequest};
