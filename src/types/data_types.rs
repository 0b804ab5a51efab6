/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to identify things or to store points in time, and do not have any major
//! "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    ops::Add,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new identifier wrapping `uuid`.
            pub const fn new(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Create a fresh, random (version 4) identifier.
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// The nil identifier. Never valid on the wire.
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }

            /// Create an identifier from its 16 raw bytes.
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Get the 16 raw bytes of this identifier.
            pub const fn bytes(&self) -> [u8; 16] {
                *self.0.as_bytes()
            }

            /// Get the inner [`Uuid`].
            pub const fn uuid(&self) -> Uuid {
                self.0
            }

            /// Whether this is the nil identifier.
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }
    };
}

uuid_identifier!(
    /// Stable identifier of a lockable element of the shared document (a graph node).
    ///
    /// The mapping from `ElementId`s to actual graph nodes belongs to the host's document model.
    ElementId
);

uuid_identifier!(
    /// Identifier of the shared document that a session collaborates on.
    ///
    /// Every client in the same session should be configured with the same `DocumentId`. Messages that
    /// carry a different `DocumentId` are discarded on receipt.
    DocumentId
);

uuid_identifier!(
    /// Identifier of the graph within the document that a message refers to.
    SubgraphId
);

/// Identifier of a user, as supplied by the host session.
///
/// `UserId`s are opaque: the only validation performed on them is that they are non-empty.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a new `UserId` wrapping `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string of this `UserId`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this `UserId` is the empty string, which is never a valid identity.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

/// A point in time, in seconds, as read from a [`Clock`](crate::clock::Clock).
///
/// Lease bounds and message timestamps are exchanged between clients as `Timestamp`s, so all clients
/// in a session should read them from clocks with a shared epoch (the default
/// [`SystemClock`](crate::clock::SystemClock) counts from the Unix epoch).
#[derive(Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(f64);

impl Timestamp {
    /// Create a new `Timestamp` from a number of seconds.
    pub const fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    /// Get the number of seconds of this `Timestamp`.
    pub const fn secs(&self) -> f64 {
        self.0
    }

    /// Whether this `Timestamp` is a finite number of seconds.
    pub fn is_finite(&self) -> bool {
        self.0.is_finite()
    }

    /// Get the duration elapsed from `earlier` to `self`, or zero if `earlier` is later than `self`.
    pub fn saturating_duration_since(&self, earlier: Timestamp) -> Duration {
        let secs = self.0 - earlier.0;
        if secs.is_finite() && secs > 0.0 {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        }
    }

    /// Get the later of `self` and `other`.
    pub fn max(self, other: Timestamp) -> Timestamp {
        if other.0 > self.0 {
            other
        } else {
            self
        }
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;
    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0 + rhs.as_secs_f64())
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({:.3})", self.0)
    }
}

#[test]
fn timestamp_arithmetic_test() {
    let t0 = Timestamp::from_secs(10.0);
    let t1 = t0 + Duration::from_millis(1500);
    assert_eq!(t1.secs(), 11.5);
    assert_eq!(t1.saturating_duration_since(t0), Duration::from_millis(1500));
    assert_eq!(t0.saturating_duration_since(t1), Duration::ZERO);
    assert_eq!(t0.max(t1), t1);
    assert_eq!(t1.max(t0), t1);
}
