//! Custom event subscriptions.
//!
//! Normal subscriptions deliver each event as it arrives. High-frequency
//! subscriptions buffer events of one name for a window of
//! `max(min_interval, 500ms)` that opens with the first buffered event,
//! then deliver the whole window as one batch in arrival order.
//!
//! The bus never reads the clock itself: callers pass `now` to
//! [`EventBus::receive`] and [`EventBus::tick`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{MemberId, ADMIN_MEMBER_ID};

/// Lower bound on a high-frequency window.
pub const HIGH_FREQUENCY_FLOOR: Duration = Duration::from_millis(500);

/// Who raised an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventScope {
    /// A writable participant.
    Member,
    /// The room itself.
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEntry {
    pub event_name: String,
    pub payload: Value,
    pub scope: EventScope,
    pub author_id: MemberId,
}

impl EventEntry {
    pub fn member(author_id: MemberId, event_name: impl Into<String>, payload: Value) -> Self {
        Self {
            event_name: event_name.into(),
            payload,
            scope: EventScope::Member,
            author_id,
        }
    }

    pub fn system(event_name: impl Into<String>, payload: Value) -> Self {
        Self {
            event_name: event_name.into(),
            payload,
            scope: EventScope::System,
            author_id: ADMIN_MEMBER_ID,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventDelivery {
    Single(EventEntry),
    Batch {
        event_name: String,
        entries: Vec<EventEntry>,
    },
}

#[derive(Debug, Clone)]
enum Subscription {
    Immediate,
    HighFrequency(Window),
}

#[derive(Debug, Clone)]
struct Window {
    length: Duration,
    opened_at: Option<Instant>,
    pending: Vec<EventEntry>,
}

impl Window {
    fn is_due(&self, now: Instant) -> bool {
        self.opened_at
            .is_some_and(|opened| now.saturating_duration_since(opened) >= self.length)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscriptions: HashMap<String, Subscription>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event_name` as it arrives. Replacing a high-frequency
    /// subscription returns whatever its open window had buffered.
    pub fn subscribe(&mut self, event_name: impl Into<String>) -> Option<EventDelivery> {
        let name = event_name.into();
        match self.subscriptions.insert(name.clone(), Subscription::Immediate)? {
            Subscription::HighFrequency(window) if !window.pending.is_empty() => {
                Some(EventDelivery::Batch {
                    event_name: name,
                    entries: window.pending,
                })
            }
            _ => None,
        }
    }

    /// Batch deliveries of `event_name`. Re-subscribing keeps buffered events.
    pub fn subscribe_high_frequency(
        &mut self,
        event_name: impl Into<String>,
        min_interval: Duration,
    ) {
        let length = min_interval.max(HIGH_FREQUENCY_FLOOR);
        let name = event_name.into();
        match self.subscriptions.get_mut(&name) {
            Some(Subscription::HighFrequency(window)) => window.length = length,
            _ => {
                self.subscriptions.insert(
                    name,
                    Subscription::HighFrequency(Window {
                        length,
                        opened_at: None,
                        pending: Vec::new(),
                    }),
                );
            }
        }
    }

    /// Returns false if not subscribed. Buffered events are dropped.
    pub fn unsubscribe(&mut self, event_name: &str) -> bool {
        self.subscriptions.remove(event_name).is_some()
    }

    /// Route an incoming event. Immediate subscriptions deliver now;
    /// high-frequency ones buffer until [`tick`](Self::tick).
    pub fn receive(&mut self, entry: EventEntry, now: Instant) -> Option<EventDelivery> {
        match self.subscriptions.get_mut(&entry.event_name)? {
            Subscription::Immediate => Some(EventDelivery::Single(entry)),
            Subscription::HighFrequency(window) => {
                window.opened_at.get_or_insert(now);
                window.pending.push(entry);
                None
            }
        }
    }

    /// Flush every window that has closed by `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<EventDelivery> {
        let mut deliveries = Vec::new();
        for (name, subscription) in &mut self.subscriptions {
            let Subscription::HighFrequency(window) = subscription else {
                continue;
            };
            if window.is_due(now) {
                window.opened_at = None;
                deliveries.push(EventDelivery::Batch {
                    event_name: name.clone(),
                    entries: std::mem::take(&mut window.pending),
                });
            }
        }
        deliveries
    }

    /// Earliest instant at which a window closes.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.subscriptions
            .values()
            .filter_map(|subscription| match subscription {
                Subscription::HighFrequency(window) => {
                    window.opened_at.map(|at| at + window.length)
                }
                Subscription::Immediate => None,
            })
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(name: &str, n: i64) -> EventEntry {
        EventEntry::member(1, name, json!(n))
    }

    #[test]
    fn test_immediate_delivery() {
        let mut bus = EventBus::new();
        assert!(bus.subscribe("ping").is_none());
        assert!(bus.subscribe("ping").is_none());
        let delivery = bus.receive(entry("ping", 1), Instant::now());
        assert_eq!(delivery, Some(EventDelivery::Single(entry("ping", 1))));
    }

    #[test]
    fn test_unsubscribed_events_are_dropped() {
        let mut bus = EventBus::new();
        assert!(bus.receive(entry("ping", 1), Instant::now()).is_none());
        bus.subscribe("ping");
        assert!(bus.unsubscribe("ping"));
        assert!(!bus.unsubscribe("ping"));
        assert!(bus.receive(entry("ping", 1), Instant::now()).is_none());
    }

    #[test]
    fn test_high_frequency_batches_one_window() {
        let mut bus = EventBus::new();
        bus.subscribe_high_frequency("x", Duration::from_millis(100));
        let start = Instant::now();
        for i in 0..5 {
            let at = start + Duration::from_millis(i * 90);
            assert!(bus.receive(entry("x", i as i64), at).is_none());
        }

        assert!(bus.tick(start + Duration::from_millis(499)).is_empty());
        let deliveries = bus.tick(start + Duration::from_millis(500));
        assert_eq!(deliveries.len(), 1);
        match &deliveries[0] {
            EventDelivery::Batch { event_name, entries } => {
                assert_eq!(event_name, "x");
                let payloads: Vec<_> = entries.iter().map(|e| e.payload.clone()).collect();
                assert_eq!(payloads, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
            }
            other => panic!("expected batch, got {other:?}"),
        }
        assert!(bus.tick(start + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn test_high_frequency_long_interval_is_honored() {
        let mut bus = EventBus::new();
        bus.subscribe_high_frequency("x", Duration::from_millis(800));
        let start = Instant::now();
        bus.receive(entry("x", 1), start);
        assert!(bus.tick(start + Duration::from_millis(600)).is_empty());
        assert_eq!(bus.next_deadline(), Some(start + Duration::from_millis(800)));
        assert_eq!(bus.tick(start + Duration::from_millis(800)).len(), 1);
    }

    #[test]
    fn test_later_subscription_kind_replaces_earlier() {
        let mut bus = EventBus::new();
        bus.subscribe("x");
        bus.subscribe_high_frequency("x", Duration::ZERO);
        assert!(bus.receive(entry("x", 1), Instant::now()).is_none());

        let flushed = bus.subscribe("x");
        assert_eq!(
            flushed,
            Some(EventDelivery::Batch {
                event_name: "x".into(),
                entries: vec![entry("x", 1)],
            })
        );
        assert!(bus.receive(entry("x", 2), Instant::now()).is_some());
        assert!(bus.next_deadline().is_none());
    }

    #[test]
    fn test_switching_empty_window_to_immediate_delivers_nothing() {
        let mut bus = EventBus::new();
        bus.subscribe_high_frequency("x", Duration::ZERO);
        let start = Instant::now();
        bus.receive(entry("x", 1), start);
        assert_eq!(bus.tick(start + HIGH_FREQUENCY_FLOOR).len(), 1);

        assert!(bus.subscribe("x").is_none());
        assert!(bus.tick(start + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn test_system_entry_provenance() {
        let e = EventEntry::system("announce", json!("hi"));
        assert_eq!(e.scope, EventScope::System);
        assert_eq!(e.author_id, ADMIN_MEMBER_ID);
    }
}
