//! The pending-event set. Events are kept in a balanced tree ordered by
//! `(time, priority, sequence)`; an index from [`EventId`] to key makes arbitrary removal
//! `O(log n)` as well.
use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    ops::Bound,
};

use crate::{
    event::{Event, EventId},
    SimError,
};

/// Spacing between consecutive sequence numbers, leaving room for positional inserts.
const SEQUENCE_STRIDE: u64 = 1 << 16;

/// Ordering key of a pending event.
#[derive(Copy, Clone, Debug)]
pub struct EventKey {
    pub time: f64,
    pub priority: f64,
    pub sequence: u64,
}

impl EventKey {
    fn same_slot(&self, other: &Self) -> bool {
        self.time.total_cmp(&other.time) == Ordering::Equal
            && self.priority.total_cmp(&other.priority) == Ordering::Equal
    }
}

impl PartialEq for EventKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EventKey {}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then_with(|| self.priority.total_cmp(&other.priority))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

/// A sequence number strictly between `low` (exclusive, if any) and `high` (exclusive).
fn midpoint(low: Option<u64>, high: u64) -> Option<u64> {
    let floor = match low {
        Some(low) => low.checked_add(1)?,
        None => 0,
    };
    (floor < high).then(|| floor + (high - floor) / 2)
}

pub struct EventList {
    entries: BTreeMap<EventKey, Event>,
    index: HashMap<EventId, EventKey>,
    next_sequence: u64,
}

impl Default for EventList {
    fn default() -> Self {
        Self::new()
    }
}

impl EventList {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_sequence: SEQUENCE_STRIDE,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn key_of(&self, id: EventId) -> Option<EventKey> {
        self.index.get(&id).copied()
    }

    fn fresh_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += SEQUENCE_STRIDE;
        sequence
    }

    fn place(&mut self, key: EventKey, event: Event) -> EventKey {
        self.index.insert(event.id(), key);
        self.entries.insert(key, event);
        key
    }

    fn anchor(&self, other: &Event) -> Result<EventKey, SimError> {
        self.key_of(other.id())
            .ok_or(SimError::ReferenceNotScheduled)
    }

    /// Insert behind every pending event with the same time and priority.
    pub fn insert(&mut self, event: Event, time: f64, priority: f64) -> EventKey {
        let sequence = self.fresh_sequence();
        self.place(
            EventKey {
                time,
                priority,
                sequence,
            },
            event,
        )
    }

    /// Insert with the time and priority of `other`, immediately ahead of it.
    pub fn insert_before(&mut self, event: Event, other: &Event) -> Result<EventKey, SimError> {
        let anchor = self.anchor(other)?;
        let below = self
            .entries
            .range(..anchor)
            .next_back()
            .map(|(key, _)| *key)
            .filter(|key| key.same_slot(&anchor))
            .map(|key| key.sequence);
        let sequence = match midpoint(below, anchor.sequence) {
            Some(sequence) => sequence,
            None => self.renumber_slot(anchor, other.id()).sequence - SEQUENCE_STRIDE / 2,
        };
        Ok(self.place(EventKey { sequence, ..anchor }, event))
    }

    /// Insert with the time and priority of `other`, immediately behind it.
    pub fn insert_after(&mut self, event: Event, other: &Event) -> Result<EventKey, SimError> {
        let anchor = self.anchor(other)?;
        let above = self
            .entries
            .range((Bound::Excluded(anchor), Bound::Unbounded))
            .next()
            .map(|(key, _)| *key)
            .filter(|key| key.same_slot(&anchor));
        let sequence = match above {
            None => self.fresh_sequence(),
            Some(above) => match midpoint(Some(anchor.sequence), above.sequence) {
                Some(sequence) => sequence,
                None => self.renumber_slot(anchor, other.id()).sequence + SEQUENCE_STRIDE / 2,
            },
        };
        Ok(self.place(EventKey { sequence, ..anchor }, event))
    }

    /// Reassign fresh, evenly spaced sequences to every event sharing `anchor`'s time and
    /// priority, keeping their relative order. Returns the new key of `anchor_id`.
    fn renumber_slot(&mut self, anchor: EventKey, anchor_id: EventId) -> EventKey {
        let low = EventKey {
            sequence: 0,
            ..anchor
        };
        let high = EventKey {
            sequence: u64::MAX,
            ..anchor
        };
        let slot: Vec<EventKey> = self.entries.range(low..=high).map(|(key, _)| *key).collect();
        let mut renumbered = anchor;
        for old in slot {
            if let Some(event) = self.entries.remove(&old) {
                let key = EventKey {
                    sequence: self.fresh_sequence(),
                    ..old
                };
                if event.id() == anchor_id {
                    renumbered = key;
                }
                self.place(key, event);
            }
        }
        renumbered
    }

    pub fn remove(&mut self, event: &Event) -> bool {
        match self.index.remove(&event.id()) {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn peek_min(&self) -> Option<(EventKey, &Event)> {
        self.entries
            .first_key_value()
            .map(|(key, event)| (*key, event))
    }

    pub fn remove_min(&mut self) -> Option<(EventKey, Event)> {
        let (key, event) = self.entries.pop_first()?;
        self.index.remove(&event.id());
        Some((key, event))
    }

    /// Remove every pending event, returning them in firing order.
    pub fn drain(&mut self) -> Vec<Event> {
        self.index.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn clear(&mut self) {
        drop(self.drain());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EventKey, &Event)> {
        self.entries.iter()
    }
}
