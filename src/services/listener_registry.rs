//! Handle-keyed listener tables shared by the router, the interceptor and the runtime.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque id returned by every listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Listeners keyed by handle, each owned by one extension.
///
/// Handles increase monotonically, so iteration order is registration order.
#[derive(Debug)]
pub struct ListenerRegistry<T> {
    next: u64,
    entries: BTreeMap<SubscriptionHandle, (String, T)>,
}

impl<T> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self {
            next: 1,
            entries: BTreeMap::new(),
        }
    }
}

impl<T> ListenerRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, owner: &str, listener: T) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next);
        self.next += 1;
        self.entries.insert(handle, (owner.to_string(), listener));
        handle
    }

    pub fn remove(&mut self, handle: SubscriptionHandle) -> Option<T> {
        self.entries.remove(&handle).map(|(_, listener)| listener)
    }

    /// Removes every listener `owner` registered and returns how many were dropped.
    pub fn remove_owner(&mut self, owner: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (o, _)| o != owner);
        before - self.entries.len()
    }

    pub fn get(&self, handle: SubscriptionHandle) -> Option<&T> {
        self.entries.get(&handle).map(|(_, listener)| listener)
    }

    pub fn owner(&self, handle: SubscriptionHandle) -> Option<&str> {
        self.entries.get(&handle).map(|(owner, _)| owner.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubscriptionHandle, &str, &T)> {
        self.entries
            .iter()
            .map(|(handle, (owner, listener))| (*handle, owner.as_str(), listener))
    }

    pub fn count_owner(&self, owner: &str) -> usize {
        self.entries.values().filter(|(o, _)| o == owner).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
