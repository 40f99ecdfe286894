//! Per-client subscription registry.
//!
//! Entries are append-only and ordered: dispatch walks them in insertion
//! order, and reconnect replays them in the same order. The registry owns
//! its callbacks (`Rc`), which is what keeps a callback alive for the whole
//! time its subscription is active.

use std::rc::Rc;

use crate::envelope::EventEnvelope;

/// Wildcard filter member matching every event, typed or not.
pub const WILDCARD: &str = "*";

/// Result type subscription callbacks return. An `Err` stops the current
/// dispatch pass and surfaces as [`crate::error::Error::CallbackFailed`].
pub type CallbackResult = anyhow::Result<()>;

/// A subscription callback, invoked once per matching event.
pub type EventCallback = Rc<dyn Fn(&EventEnvelope) -> CallbackResult>;

/// The event names one entry was registered for. The literal `"*"` member
/// makes the filter match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct EventFilter {
    names: Vec<String>,
}

impl EventFilter {
    pub(crate) fn new(events: &[&str]) -> Self {
        let mut names = Vec::with_capacity(events.len());
        for event in events {
            if !names.iter().any(|existing| existing == event) {
                names.push((*event).to_string());
            }
        }
        EventFilter { names }
    }

    /// Whether an event of the given type reaches this entry. Untyped
    /// events match only the wildcard.
    pub(crate) fn matches(&self, event_type: Option<&str>) -> bool {
        if self.names.iter().any(|name| name == WILDCARD) {
            return true;
        }
        match event_type {
            Some(event_type) => self.names.iter().any(|name| name == event_type),
            None => false,
        }
    }

    pub(crate) fn names(&self) -> &[String] {
        &self.names
    }
}

pub(crate) struct SubscriptionEntry {
    filter: EventFilter,
    callback: EventCallback,
}

/// Ordered table of (filter, callback) entries for one client.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Vec<SubscriptionEntry>,
}

impl SubscriptionRegistry {
    /// Append an entry. Entries are never removed individually; see the
    /// unsubscribe notes on [`crate::client::Client`].
    pub(crate) fn append(&mut self, events: &[&str], callback: EventCallback) {
        self.entries.push(SubscriptionEntry {
            filter: EventFilter::new(events),
            callback,
        });
    }

    /// Snapshot the callbacks matching an event type, in insertion order.
    ///
    /// Cloned handles are returned so the caller can release its borrow of
    /// the registry before invoking anything; callbacks are free to
    /// re-enter the client and append further entries.
    pub(crate) fn matching(&self, event_type: Option<&str>) -> Vec<EventCallback> {
        self.entries
            .iter()
            .filter(|entry| entry.filter.matches(event_type))
            .map(|entry| Rc::clone(&entry.callback))
            .collect()
    }

    /// Every event name of every entry, in entry order, for reconnect
    /// replay. The wildcard is replayed literally.
    pub(crate) fn replay_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|entry| entry.filter.names().iter().cloned())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn noop() -> EventCallback {
        Rc::new(|_| Ok(()))
    }

    #[test]
    fn test_filter_matches_exact_type() {
        let filter = EventFilter::new(&["window_moved", "focus_changed"]);
        assert!(filter.matches(Some("window_moved")));
        assert!(filter.matches(Some("focus_changed")));
        assert!(!filter.matches(Some("display_added")));
        assert!(!filter.matches(None));
    }

    #[test]
    fn test_wildcard_matches_everything() {
        let filter = EventFilter::new(&[WILDCARD]);
        assert!(filter.matches(Some("anything")));
        assert!(filter.matches(None));
    }

    #[test]
    fn test_wildcard_mixed_with_names_still_matches_everything() {
        let filter = EventFilter::new(&["window_moved", WILDCARD]);
        assert!(filter.matches(Some("display_added")));
        assert!(filter.matches(None));
    }

    #[test]
    fn test_filter_dedupes_but_keeps_order() {
        let filter = EventFilter::new(&["a", "b", "a", "c", "b"]);
        assert_eq!(filter.names(), ["a", "b", "c"]);
    }

    #[test]
    fn test_matching_preserves_insertion_order() {
        let order = Rc::new(Cell::new(Vec::new()));
        let mut registry = SubscriptionRegistry::default();
        for tag in ["first", "second", "third"] {
            let order = Rc::clone(&order);
            registry.append(
                &["tick"],
                Rc::new(move |_| {
                    let mut seen = order.take();
                    seen.push(tag);
                    order.set(seen);
                    Ok(())
                }),
            );
        }

        let envelope = crate::envelope::EventEnvelope::from_payload(br#"{"type":"tick"}"#.to_vec());
        for callback in registry.matching(Some("tick")) {
            callback(&envelope).expect("callback failed");
        }
        assert_eq!(order.take(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_matching_skips_non_matching_entries() {
        let mut registry = SubscriptionRegistry::default();
        registry.append(&["a"], noop());
        registry.append(&["b"], noop());
        registry.append(&[WILDCARD], noop());

        assert_eq!(registry.matching(Some("a")).len(), 2);
        assert_eq!(registry.matching(Some("b")).len(), 2);
        assert_eq!(registry.matching(None).len(), 1);
    }

    #[test]
    fn test_replay_names_flatten_in_entry_order() {
        let mut registry = SubscriptionRegistry::default();
        registry.append(&["a", "b"], noop());
        registry.append(&[WILDCARD], noop());
        assert_eq!(registry.replay_names(), vec!["a", "b", "*"]);
    }

    #[test]
    fn test_clear_empties_registry() {
        let mut registry = SubscriptionRegistry::default();
        registry.append(&["a"], noop());
        assert_eq!(registry.len(), 1);
        registry.clear();
        assert_eq!(registry.len(), 0);
    }
}
