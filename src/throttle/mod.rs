//! Per-user, per-kind rate limiting of outbound messages.
//!
//! # Why throttle
//!
//! Some message kinds are produced at interactive rates. A user dragging a wire across the canvas
//! generates a [`WirePreview`](crate::messages::MessageKind::WirePreview) for every mouse move, far
//! more than peers need to render a smooth preview. The [`MessageThrottler`] caps each such kind to
//! at most one message per configured interval, per user.
//!
//! Only *preview-class* kinds (those for which
//! [`MessageKind::is_throttleable`](crate::messages::MessageKind::is_throttleable) is true) are
//! checked against the throttler by the [replicator](crate::replication::Replicator). Lock and
//! structural messages are required for correctness and are never suppressed, whatever their
//! configured interval. Every message that goes out is still recorded, so
//! [`ThrottleStats`] count sends of every kind.
//!
//! # Memory
//!
//! The throttler keeps a history of [`ThrottleRecord`]s, one per message sent, and decides whether a
//! message may be sent by scanning this history from newest to oldest. The history is bounded by two
//! ceilings that are enforced independently on every send:
//! 1. **Age**: records older than
//!    [`max_history_age`](types::ThrottleConfiguration::max_history_age) are dropped.
//! 2. **Count**: if more than
//!    [`max_history_records`](types::ThrottleConfiguration::max_history_records) remain, the oldest
//!    are dropped.
//!
//! # Defaults
//!
//! | Kind | Interval | Enabled |
//! |---|---|---|
//! | `WirePreview` | 100 ms | yes |
//! | `Heartbeat` | 1 s | yes |
//! | `NodeOperation`, `LockRequest`, `LockRelease` | 0 | no |

pub mod types;

pub(crate) mod implementation;

pub use implementation::MessageThrottler;

pub use types::{ThrottleConfiguration, ThrottleRecord, ThrottleStats};
