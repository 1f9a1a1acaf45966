use std::fmt::Display;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::lock::Mutex;
use serde::{
    Deserialize,
    Serialize,
    de::{
        Unexpected,
        Visitor,
    },
};
use thiserror::Error;

/// An identifier used across WAMP messages, such as for sessions, requests, subscriptions,
/// registrations, and publications.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Id(u64);

impl Id {
    pub const MIN: u64 = 1;
    pub const MAX: u64 = 1 << 53;
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
#[error("{value} is out of range for IDs")]
pub struct IdOutOfRange {
    value: u64,
}

impl IdOutOfRange {
    fn new(value: u64) -> Self {
        Self { value }
    }
}

impl From<Id> for u64 {
    fn from(value: Id) -> Self {
        value.0
    }
}

impl TryFrom<u64> for Id {
    type Error = IdOutOfRange;
    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value < Self::MIN || value > Self::MAX {
            Err(IdOutOfRange::new(value))
        } else {
            Ok(Id(value))
        }
    }
}

struct IdVisitor;

impl<'de> Visitor<'de> for IdVisitor {
    type Value = Id;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            "an unsigned integer in the range [{}, {}]",
            Id::MIN,
            Id::MAX
        )
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Id::try_from(v).map_err(|_| E::invalid_value(Unexpected::Unsigned(v), &self))
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_u64(IdVisitor)
    }
}

/// An allocator for [`Id`]s within some scope.
#[async_trait]
pub trait IdAllocator: Send + Sync {
    /// Generates the next ID.
    async fn generate_id(&self) -> Result<Id>;

    /// Resets the allocator for a new scope.
    async fn reset(&self) {}
}

/// An [`IdAllocator`] that draws IDs uniformly from the full ID range.
///
/// Used for IDs in the global scope, where IDs must not be guessable.
#[derive(Default)]
pub struct RandomIdAllocator {}

#[async_trait]
impl IdAllocator for RandomIdAllocator {
    async fn generate_id(&self) -> Result<Id> {
        let id = (rand::random::<u64>() & (Id::MAX - 1)) + 1;
        Ok(Id(id))
    }
}

/// An [`IdAllocator`] that hands out IDs sequentially, starting from 1.
///
/// Used for IDs in the session scope, such as invocation request IDs.
#[derive(Default)]
pub struct SequentialIdAllocator {
    next: Mutex<u64>,
}

#[async_trait]
impl IdAllocator for SequentialIdAllocator {
    async fn generate_id(&self) -> Result<Id> {
        let mut lock = self.next.lock().await;
        *lock += 1;
        Ok(Id::try_from(*lock)?)
    }

    async fn reset(&self) {
        *self.next.lock().await = 0;
    }
}

#[cfg(test)]
mod id_test {
    use crate::core::id::{
        Id,
        IdAllocator,
        SequentialIdAllocator,
    };

    #[test]
    fn fails_deserialization_out_of_range() {
        assert_matches::assert_matches!(serde_json::from_str::<Id>(r#"0"#), Err(err) => {
            assert!(err.to_string().contains("expected an unsigned integer in the range"));
        });
        assert_matches::assert_matches!(serde_json::from_str::<Id>(r#"9007199254740993"#), Err(err) => {
            assert!(err.to_string().contains("expected an unsigned integer in the range"));
        });
    }

    #[tokio::test]
    async fn sequential_allocator_restarts_after_reset() {
        let allocator = SequentialIdAllocator::default();
        assert_matches::assert_matches!(allocator.generate_id().await, Ok(id) => {
            assert_eq!(id, Id::try_from(1).unwrap());
        });
        assert_matches::assert_matches!(allocator.generate_id().await, Ok(id) => {
            assert_eq!(id, Id::try_from(2).unwrap());
        });
        allocator.reset().await;
        assert_matches::assert_matches!(allocator.generate_id().await, Ok(id) => {
            assert_eq!(id, Id::try_from(1).unwrap());
        });
    }
}
