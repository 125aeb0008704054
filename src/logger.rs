//! A bounded record of dispatched events. Records are plain old data so a whole log can be
//! viewed as bytes, which makes comparing two runs for determinism a slice comparison.
use bytemuck::{Pod, Zeroable};

use crate::{event::EventId, eventlist::EventKey};

/// One dispatched event: the key it fired under and its identity.
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(C)]
pub struct DispatchRecord {
    pub time: f64,
    pub priority: f64,
    pub sequence: u64,
    pub event: u64,
}

unsafe impl Zeroable for DispatchRecord {}
unsafe impl Pod for DispatchRecord {}

#[derive(Clone, Debug)]
pub struct DispatchLog {
    records: Vec<DispatchRecord>,
    capacity: usize,
    dropped: u64,
}

impl DispatchLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity.min(4096)),
            capacity,
            dropped: 0,
        }
    }

    /// Append a record; once `capacity` records are held further dispatches are only counted.
    pub fn record(&mut self, key: &EventKey, event: EventId) {
        if self.records.len() >= self.capacity {
            self.dropped += 1;
            return;
        }
        self.records.push(DispatchRecord {
            time: key.time,
            priority: key.priority,
            sequence: key.sequence,
            event: event.0,
        });
    }

    pub fn records(&self) -> &[DispatchRecord] {
        &self.records
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.records)
    }

    /// Number of dispatches that did not fit.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.dropped = 0;
    }
}
