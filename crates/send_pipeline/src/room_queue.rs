use std::collections::VecDeque;

use shared::domain::{EventId, RoomId};

use crate::send_unit::SendUnit;

/// FIFO admission for one room: at most one unit in flight, released in
/// local-echo creation order.
///
/// A unit that fails transiently stays in flight through its backoff and is
/// then put back at the front, so no later echo overtakes it.
#[derive(Debug)]
pub struct RoomSendQueue {
    room_id: RoomId,
    pending: VecDeque<SendUnit>,
    in_flight: Option<EventId>,
}

impl RoomSendQueue {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            pending: VecDeque::new(),
            in_flight: None,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn in_flight(&self) -> Option<&EventId> {
        self.in_flight.as_ref()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Nothing queued and nothing running.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    /// Queue a unit by creation position. Returns `false` if the event is
    /// already waiting.
    ///
    /// An event that is currently in flight is still queued: a manual resend
    /// can land after the running unit stored its failure but before it
    /// finished, and the new run is released once `finish` is called.
    pub fn push(&mut self, unit: SendUnit) -> bool {
        if self.pending.iter().any(|queued| queued.event_id() == unit.event_id()) {
            return false;
        }
        let index = self
            .pending
            .iter()
            .position(|queued| queued.position() > unit.position())
            .unwrap_or(self.pending.len());
        self.pending.insert(index, unit);
        true
    }

    /// Put a unit that needs another attempt ahead of everything queued.
    pub fn requeue_front(&mut self, unit: SendUnit) {
        if self.in_flight.as_ref() == Some(unit.event_id()) {
            self.in_flight = None;
        }
        self.pending.retain(|queued| queued.event_id() != unit.event_id());
        self.pending.push_front(unit);
    }

    /// Release the next unit unless one is already running.
    pub fn start_next(&mut self) -> Option<SendUnit> {
        if self.in_flight.is_some() {
            return None;
        }
        let unit = self.pending.pop_front()?;
        self.in_flight = Some(unit.event_id().clone());
        Some(unit)
    }

    pub fn finish(&mut self, event_id: &EventId) {
        if self.in_flight.as_ref() == Some(event_id) {
            self.in_flight = None;
        }
    }

    /// Drop a queued unit that has not been released yet.
    pub fn remove(&mut self, event_id: &EventId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|unit| unit.event_id() != event_id);
        self.pending.len() != before
    }

    /// Drop every queued unit; the one in flight, if any, runs to completion.
    pub fn clear_pending(&mut self) -> Vec<EventId> {
        self.pending
            .drain(..)
            .map(|unit| unit.event_id().clone())
            .collect()
    }
}
