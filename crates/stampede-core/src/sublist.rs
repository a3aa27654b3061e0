// Ordered round-robin set of subscription handles.
use std::collections::VecDeque;

use crate::subscription::SubscriptionRef;

/// Fair ready-set: `take_next` pops the head, re-added handles land at the
/// tail, so delivery rotates over subscribers.
#[derive(Debug, Default)]
pub struct SubscriptionList {
    subs: VecDeque<SubscriptionRef>,
}

impl SubscriptionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unless a handle with the same identity is already present.
    pub fn add(&mut self, sub: SubscriptionRef) {
        if !self.subs.iter().any(|s| s.is(sub.conn_id, &sub.sub_id)) {
            self.subs.push_back(sub);
        }
    }

    /// Remove by identity.
    pub fn remove(&mut self, conn_id: u64, sub_id: &str) {
        self.subs.retain(|s| !s.is(conn_id, sub_id));
    }

    /// Remove every handle belonging to a connection; used on teardown.
    pub fn remove_connection(&mut self, conn_id: u64) {
        self.subs.retain(|s| s.conn_id != conn_id);
    }

    /// Pop the head of the rotation, or `None` when empty.
    pub fn take_next(&mut self) -> Option<SubscriptionRef> {
        self.subs.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriptionRef> {
        self.subs.iter()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}
