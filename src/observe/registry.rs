//! Per-resource subscriber storage.
//!
//! Entries are kept in insertion order under stable ordinals. A
//! [`MatchCursor`] remembers the ordinal it last visited instead of holding a
//! borrow, so the registry can be mutated between steps of a fan-out without
//! skipping or repeating the remaining entries.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use crate::message::{SessionId, Token};

use super::subscription::{SubscriberKey, Subscription, SubscriptionId};

/// Subscribers of a single resource.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    entries: BTreeMap<u64, Subscription>,
    index: HashMap<SubscriberKey, u64>,
    next_ordinal: u64,
}

impl SubscriberRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nobody observes the resource.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stores `sub`, replacing any record with the same (session, token).
    ///
    /// A replacement keeps the original position in iteration order. Returns
    /// the replaced record.
    pub fn insert_or_replace(&mut self, sub: Subscription) -> Option<Subscription> {
        let key = sub.key();
        if let Some(&ordinal) = self.index.get(&key) {
            return self.entries.insert(ordinal, sub);
        }

        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.index.insert(key, ordinal);
        self.entries.insert(ordinal, sub);
        None
    }

    /// Removes the record for (session, token), if any.
    pub fn remove(&mut self, session: &SessionId, token: &Token) -> Option<Subscription> {
        let key = SubscriberKey::new(session.clone(), token.clone());
        let ordinal = self.index.remove(&key)?;
        self.entries.remove(&ordinal)
    }

    /// Removes the record for (session, token) only if it is still the
    /// establish identified by `id`.
    pub fn remove_if_current(
        &mut self,
        session: &SessionId,
        token: &Token,
        id: SubscriptionId,
    ) -> Option<Subscription> {
        match self.find(session, token) {
            Some(sub) if sub.id == id => self.remove(session, token),
            _ => None,
        }
    }

    /// Removes every record belonging to `session`, in insertion order.
    pub fn remove_all_for_session(&mut self, session: &SessionId) -> Vec<Subscription> {
        let ordinals: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, sub)| &sub.session == session)
            .map(|(ordinal, _)| *ordinal)
            .collect();

        let mut removed = Vec::with_capacity(ordinals.len());
        for ordinal in ordinals {
            if let Some(sub) = self.entries.remove(&ordinal) {
                self.index.remove(&sub.key());
                removed.push(sub);
            }
        }
        removed
    }

    /// Empties the registry, returning the records in insertion order.
    pub fn drain(&mut self) -> Vec<Subscription> {
        self.index.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// The record for (session, token), if any.
    #[must_use]
    pub fn find(&self, session: &SessionId, token: &Token) -> Option<&Subscription> {
        let key = SubscriberKey::new(session.clone(), token.clone());
        self.index.get(&key).and_then(|ordinal| self.entries.get(ordinal))
    }

    /// Mutable access to the record for (session, token).
    pub fn find_mut(&mut self, session: &SessionId, token: &Token) -> Option<&mut Subscription> {
        let key = SubscriberKey::new(session.clone(), token.clone());
        let ordinal = *self.index.get(&key)?;
        self.entries.get_mut(&ordinal)
    }

    /// The record for (session, token) if it is still the establish `id`.
    pub fn find_current_mut(
        &mut self,
        session: &SessionId,
        token: &Token,
        id: SubscriptionId,
    ) -> Option<&mut Subscription> {
        self.find_mut(session, token).filter(|sub| sub.id == id)
    }

    /// All records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.values()
    }

    /// A restartable cursor over records matching `query`.
    #[must_use]
    #[allow(clippy::unused_self)]
    pub fn iterate_matching(&self, query: Option<&str>) -> MatchCursor {
        MatchCursor::new(query)
    }

    /// Borrowing iterator over records matching `query`.
    pub fn iter_matching<'a>(&'a self, query: Option<&'a str>) -> impl Iterator<Item = &'a Subscription> + 'a {
        self.entries.values().filter(move |sub| sub.matches(query))
    }
}

/// Position within a registry fan-out.
///
/// The cursor does not borrow the registry; each step looks up the next
/// matching ordinal strictly after the last one returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchCursor {
    query: Option<String>,
    after: Option<u64>,
}

impl MatchCursor {
    /// A cursor positioned before the first record matching `query`.
    #[must_use]
    pub fn new(query: Option<&str>) -> Self {
        Self {
            query: query.map(str::to_string),
            after: None,
        }
    }

    /// Returns the next matching record, or `None` once the registry is exhausted.
    pub fn next<'r>(&mut self, registry: &'r SubscriberRegistry) -> Option<&'r Subscription> {
        let lower = match self.after {
            Some(ordinal) => Bound::Excluded(ordinal),
            None => Bound::Unbounded,
        };
        let query = self.query.as_deref();
        let (ordinal, sub) = registry
            .entries
            .range((lower, Bound::Unbounded))
            .find(|(_, sub)| sub.matches(query))?;
        self.after = Some(*ordinal);
        Some(sub)
    }

    /// Rewinds to the first record.
    pub fn restart(&mut self) {
        self.after = None;
    }

    /// Collects the remaining matches as owned records.
    pub fn collect_remaining(&mut self, registry: &SubscriberRegistry) -> Vec<Subscription> {
        let mut out = Vec::new();
        while let Some(sub) = self.next(registry) {
            out.push(sub.clone());
        }
        out
    }
}
