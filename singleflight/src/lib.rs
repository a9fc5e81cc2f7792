//! Duplicate call suppression for asynchronous work.
//!
//! A [`Group`] maps an opaque [`Key`] to at most one in-flight unit of work.
//! Callers that ask for the same key while that work is pending receive a
//! [`Waiter`] on the same execution instead of starting their own, and every
//! waiter observes the same outcome. The entry is dropped as soon as the work
//! settles, so nothing is cached: the next call for the key starts fresh work.
use std::fmt;
use std::sync::Arc;

mod group;

pub use group::{Group, Waiter};

/// Failure shared by every waiter of one execution.
///
/// All waiters receive clones of the same `Arc`, so `Arc::ptr_eq` holds
/// between the errors they observe.
pub type SharedError = Arc<anyhow::Error>;

/// Key identifies a unit of work inside a [`Group`].
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Key(Arc<str>);

impl Key {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Key(Arc::from(key))
    }
}

impl From<String> for Key {
    fn from(key: String) -> Self {
        Key(Arc::from(key))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
