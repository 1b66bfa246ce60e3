//! Item identity and per-item outcomes
//!
//! Every value that flows through a pipeline is tagged with the identity of
//! the request that produced it, so a failure three stages in is still
//! reported against the original id rather than some intermediate value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identity of a unit of work (a numeric id, a remote filename, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for ItemId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<usize> for ItemId {
    fn from(id: usize) -> Self {
        Self(id.to_string())
    }
}

/// A value paired with its originating identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item<T> {
    pub id: ItemId,
    pub value: T,
}

impl<T> Item<T> {
    pub fn new(id: impl Into<ItemId>, value: T) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

/// Why an item failed.
///
/// Wraps the original `anyhow::Error` (including its context chain) behind an
/// `Arc`, so one batch-level error can be attached to every item of the batch.
#[derive(Clone)]
pub struct Cause(Arc<anyhow::Error>);

impl Cause {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    /// Cause built from a plain message
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::new(anyhow::Error::msg(message))
    }

    /// Messages of the error and all of its sources, outermost first
    pub fn chain(&self) -> Vec<String> {
        self.0.chain().map(|e| e.to_string()).collect()
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(f, "{:#}", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl From<anyhow::Error> for Cause {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}

/// Result of one pipeline stage for one item.
///
/// Exactly one of output or cause is present. Outcomes are never mutated;
/// each stage produces fresh ones and relays earlier failures as they are.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Success { id: ItemId, value: T },
    Failure { id: ItemId, cause: Cause },
}

impl<T> Outcome<T> {
    pub fn success(id: impl Into<ItemId>, value: T) -> Self {
        Outcome::Success {
            id: id.into(),
            value,
        }
    }

    pub fn failure(id: impl Into<ItemId>, cause: impl Into<Cause>) -> Self {
        Outcome::Failure {
            id: id.into(),
            cause: cause.into(),
        }
    }

    pub fn id(&self) -> &ItemId {
        match self {
            Outcome::Success { id, .. } | Outcome::Failure { id, .. } => id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Success { value, .. } => Some(value),
            Outcome::Failure { .. } => None,
        }
    }

    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Failure { cause, .. } => Some(cause),
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Success { value, .. } => Some(value),
            Outcome::Failure { .. } => None,
        }
    }

    /// Split into work still to do or a failure relayed to the next stage.
    ///
    /// The failure keeps its id and cause; only its output type changes.
    pub fn into_item<U>(self) -> Result<Item<T>, Outcome<U>> {
        match self {
            Outcome::Success { id, value } => Ok(Item { id, value }),
            Outcome::Failure { id, cause } => Err(Outcome::Failure { id, cause }),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success { id, value } => Outcome::Success {
                id,
                value: f(value),
            },
            Outcome::Failure { id, cause } => Outcome::Failure { id, cause },
        }
    }
}

impl<T> From<Item<T>> for Outcome<T> {
    fn from(item: Item<T>) -> Self {
        Outcome::Success {
            id: item.id,
            value: item.value,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_failure_keeps_identity_when_relayed() {
        let failed: Outcome<u32> = Outcome::failure(7u64, Cause::msg("timeout"));
        let relayed: Outcome<String> = failed.into_item::<String>().unwrap_err();

        assert_eq!(relayed.id().as_str(), "7");
        assert!(relayed.is_failure());
        assert_eq!(relayed.cause().unwrap().to_string(), "timeout");
    }

    #[test]
    fn test_success_splits_into_item() {
        let ok = Outcome::success("a.csv", 3);
        let item = ok.into_item::<()>().unwrap();
        assert_eq!(item, Item::new("a.csv", 3));
    }

    #[test]
    fn test_cause_chain_keeps_context() {
        let err = Err::<(), _>(std::io::Error::other("disk full"))
            .context("write batch_1")
            .unwrap_err();
        let cause = Cause::new(err);

        assert_eq!(cause.to_string(), "write batch_1");
        assert_eq!(cause.chain(), vec!["write batch_1", "disk full"]);
        assert_eq!(format!("{:#}", cause), "write batch_1: disk full");
    }

    #[test]
    fn test_map_only_touches_successes() {
        let doubled = Outcome::success(1u64, 21).map(|v| v * 2);
        assert_eq!(doubled.value(), Some(&42));

        let failed: Outcome<i32> = Outcome::failure(2u64, Cause::msg("boom"));
        assert!(failed.map(|v| v * 2).is_failure());
    }
}
