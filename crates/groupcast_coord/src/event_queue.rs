//! Per-channel ordered event queue with write-buffer accounting.
//!
//! The queue is a durable object owned by the channel's coordinator node.
//! Events complete strictly in enqueue order: an event marked
//! `processing` under the local node blocks the head until it is
//! completed, while a `processing` marker left by a *different* node is
//! an abandoned attempt and gets restarted by the next drain.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use groupcast_proto::ChannelError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelEventKind {
    Join {
        session_id: String,
        node_id: String,
    },
    Leave {
        session_id: String,
        node_id: String,
    },
    Send {
        sender_id: Option<String>,
        was_member_at_enqueue: bool,
        payload: Vec<u8>,
    },
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub event_id: u64,
    pub timestamp: u64,
    pub completed: bool,
    pub processing_node_id: Option<String>,
    pub kind: ChannelEventKind,
}

impl ChannelEvent {
    /// Cost charged against the channel's write buffer. Only message
    /// payloads count; membership events are free.
    pub fn cost(&self) -> usize {
        match &self.kind {
            ChannelEventKind::Send { payload, .. } => payload.len(),
            _ => 0,
        }
    }
}

/// Identity and timestamp assigned to a successfully offered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferReceipt {
    pub event_id: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQueueState {
    pub channel_id: String,
    events: VecDeque<ChannelEvent>,
    next_event_id: u64,
    next_timestamp: u64,
    current_timestamp: u64,
    coordinator_assignment_timestamp: u64,
    write_buffer_available: usize,
    send_refresh: bool,
}

impl EventQueueState {
    pub fn new(channel_id: &str, write_buffer_capacity: usize) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            events: VecDeque::new(),
            next_event_id: 1,
            next_timestamp: 1,
            current_timestamp: 0,
            coordinator_assignment_timestamp: 0,
            write_buffer_available: write_buffer_capacity,
            send_refresh: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn head(&self) -> Option<&ChannelEvent> {
        self.events.front()
    }

    pub fn next_timestamp(&self) -> u64 {
        self.next_timestamp
    }

    /// Timestamp of the last Send that started processing.
    pub fn current_timestamp(&self) -> u64 {
        self.current_timestamp
    }

    pub fn coordinator_assignment_timestamp(&self) -> u64 {
        self.coordinator_assignment_timestamp
    }

    pub fn write_buffer_available(&self) -> usize {
        self.write_buffer_available
    }

    /// Enqueues an event, assigning its id and timestamp.
    ///
    /// Send events take `next_timestamp` and increment it; Join, Leave
    /// and Close take `next_timestamp` without incrementing, so a burst
    /// of membership events between two Sends carries the timestamp of
    /// the next Send that has not yet occurred.
    ///
    /// Fails with `ResourceExhausted` when the event's cost exceeds the
    /// remaining write buffer, leaving the queue untouched.
    pub fn offer(&mut self, kind: ChannelEventKind) -> Result<OfferReceipt, ChannelError> {
        let event = ChannelEvent {
            event_id: 0,
            timestamp: 0,
            completed: false,
            processing_node_id: None,
            kind,
        };
        let cost = event.cost();
        if cost > self.write_buffer_available {
            return Err(ChannelError::ResourceExhausted {
                available: self.write_buffer_available,
                requested: cost,
            });
        }
        let event_id = self.next_event_id;
        let next_event_id = checked_counter_increment(event_id, "event_id")?;
        let timestamp = self.next_timestamp;
        let next_timestamp = if matches!(event.kind, ChannelEventKind::Send { .. }) {
            checked_counter_increment(timestamp, "timestamp")?
        } else {
            timestamp
        };

        self.next_event_id = next_event_id;
        self.next_timestamp = next_timestamp;
        self.write_buffer_available -= cost;
        self.events.push_back(ChannelEvent {
            event_id,
            timestamp,
            ..event
        });
        Ok(OfferReceipt {
            event_id,
            timestamp,
        })
    }

    /// Marks the head event as being serviced by `node_id`. For Send
    /// events this also advances `current_timestamp`.
    pub fn mark_head_processing(&mut self, node_id: &str) -> Option<&ChannelEvent> {
        let current = &mut self.current_timestamp;
        let head = self.events.front_mut()?;
        head.processing_node_id = Some(node_id.to_string());
        if matches!(head.kind, ChannelEventKind::Send { .. }) {
            *current = head.timestamp;
        }
        Some(&*head)
    }

    /// Marks the event with `event_id` completed. Returns `false` if it
    /// is no longer in the queue (already completed and removed).
    pub fn complete(&mut self, event_id: u64) -> bool {
        match self.events.iter_mut().find(|e| e.event_id == event_id) {
            Some(event) => {
                event.completed = true;
                true
            }
            None => false,
        }
    }

    /// Removes the head event if it is completed, restoring its cost to
    /// the write buffer.
    pub fn remove_completed_head(&mut self) -> Option<ChannelEvent> {
        if !self.events.front()?.completed {
            return None;
        }
        let event = self.events.pop_front()?;
        self.write_buffer_available += event.cost();
        Some(event)
    }

    /// Records a coordinator reassignment: everything below the current
    /// `next_timestamp` becomes the possibly-duplicated recovery window,
    /// and the next drain must refresh the channel's server nodes.
    pub fn mark_coordinator_assignment(&mut self) {
        self.coordinator_assignment_timestamp = self.next_timestamp;
        self.send_refresh = true;
    }

    /// Consumes the pending-refresh flag.
    pub fn take_send_refresh(&mut self) -> bool {
        std::mem::take(&mut self.send_refresh)
    }
}

fn checked_counter_increment(value: u64, field: &str) -> Result<u64, ChannelError> {
    value
        .checked_add(1)
        .ok_or_else(|| ChannelError::ValidationFailed {
            reason: format!("event queue {field} overflow at {value}"),
        })
}
